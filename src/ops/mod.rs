pub mod attention;

pub use attention::{scaled_dot_product_attention, CpuAttention};
