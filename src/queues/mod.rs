//! Our two processing stages, and the worker pool which runs them.

pub mod fields;
pub mod ocr;
pub mod work;
