use crate::common::*;

#[derive(Debug)]
pub enum LogMessage {
    /// Scalar values keyed by their TensorBoard tag.
    Scalars {
        step: usize,
        scalars: IndexMap<String, f64>,
    },
}
