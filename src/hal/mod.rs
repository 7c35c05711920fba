//! Built-in operators: the shape algebra they share, their definitions and their kernels.

pub mod cpu;
pub mod ops;
pub mod shape;
