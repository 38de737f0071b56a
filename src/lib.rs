//! chroutine —— 有栈协程运行时
//!
//! 多线程协作式调度核心。每个工作线程拥有一组本地协程，
//! 在自己的执行上下文上轮转驱动，并在同一个驱动循环里轮询注册的可选对象。
//!
//! 核心组件：
//! - Chroutine: 协程，拥有独立栈与保存的执行上下文
//! - WorkerThread: 工作线程，驱动本地调度循环
//! - Reporter: 父子协程间的单槽结果回报

pub mod config;
pub mod runtime;

pub use runtime::chroutine::{Chroutine, ChroutineArg, ChroutineFn, ChroutineState, CreateError};
pub use runtime::engine::WorkerPool;
pub use runtime::reporter::{Reporter, ReporterBase, SonResult};
pub use runtime::selector::Selectable;
pub use runtime::worker::{self, WorkerState, WorkerThread};
pub use runtime::{ChroutineId, INVALID_ID};
