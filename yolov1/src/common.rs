//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use itertools::{izip, Itertools as _};
pub use log::{info, warn};
pub use std::{
    borrow::Borrow,
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};
pub use tch::{
    nn::{self, ModuleT},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
