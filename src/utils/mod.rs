//! Small helpers shared by the codecs.

mod compressed;
mod math;

pub use compressed::compress_uint;
pub use math::{align_to_4, to_u32};
