//! The building blocks of a YOLOv1-style grid detector.

mod common;

pub mod bbox;
pub mod dataset;
pub mod encoder;
pub mod loss;
pub mod model;
