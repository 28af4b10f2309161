pub mod distill;
pub mod encode;
