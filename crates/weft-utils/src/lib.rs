mod arrayvec;
mod assert;
pub mod bstr;

pub use arrayvec::ArrayVec;
