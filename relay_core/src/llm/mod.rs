pub mod adapter;
pub mod upstream;
