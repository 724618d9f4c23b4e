//! 展示层边界：普通异步函数，返回 `Result<T, String>`

pub mod log;
pub mod settings;
pub mod sync;
