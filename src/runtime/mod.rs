//! 协程运行时模块
//!
//! 有栈协程的多线程协作式调度系统
//!
//! 核心组件：
//! - Chroutine: 协程，包含自己的栈和执行上下文
//! - WorkerThread: 工作线程，驱动本地协程的轮转调度
//! - Reporter: 父子协程间的单槽结果回报
//! - Selectable: 注册到工作线程的可轮询对象

pub mod chroutine;
pub mod clock;
pub mod engine;
pub mod reporter;
pub mod selector;
pub mod worker;

pub use chroutine::{Chroutine, ChroutineArg, ChroutineFn, ChroutineState, CreateError};
pub use engine::WorkerPool;
pub use reporter::{Reporter, ReporterBase, SonResult};
pub use selector::Selectable;
pub use worker::{WorkerState, WorkerThread};

use std::sync::atomic::{AtomicU64, Ordering};

/// 协程 ID 类型
pub type ChroutineId = u64;

/// 无效协程 ID
pub const INVALID_ID: ChroutineId = 0;

/// 协程 ID 计数器，0 保留为无效 ID
static NEXT_CHROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// 生成进程内唯一的协程 ID
pub(crate) fn gen_chroutine_id() -> ChroutineId {
    NEXT_CHROUTINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// 获取当前 CPU 核心数
pub fn num_workers() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_chroutine_id_unique() {
        let a = gen_chroutine_id();
        let b = gen_chroutine_id();
        assert_ne!(a, INVALID_ID);
        assert_ne!(b, INVALID_ID);
        assert!(b > a);
    }

    #[test]
    fn test_num_workers() {
        assert!(num_workers() >= 1);
    }
}
