pub mod eval;
pub mod frame;
pub mod machine;
