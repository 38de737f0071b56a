//! 父子协程结果回报
//!
//! 父协程与子协程共享的单槽结果载体：
//! 结果一旦离开 Pending 就不再改变，数据槽由父协程预置、子协程读写

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// 子协程的执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SonResult {
    /// 尚未出结果
    Pending = 0,
    /// 正常完成
    Done = 1,
    /// 父协程等待超时
    Timeout = 2,
    /// 执行出错
    Error = 3,
}

impl From<u8> for SonResult {
    fn from(v: u8) -> Self {
        match v {
            0 => SonResult::Pending,
            1 => SonResult::Done,
            2 => SonResult::Timeout,
            _ => SonResult::Error,
        }
    }
}

/// 回报器的类型擦除接口
///
/// 协程对象只持有写结果的一端，数据槽的具体类型由创建方掌握
pub trait ReporterBase: Send + Sync {
    /// 写入结果，仅第一次从 Pending 出发的写入生效
    fn set_result(&self, result: SonResult);

    /// 读取结果
    fn result(&self) -> SonResult;
}

/// 单槽结果回报器
///
/// 结果由子协程或调度器写入（单写者），父协程唤醒后读取；
/// 数据槽在子协程启动前由父协程预置，子协程入口可读写
pub struct Reporter<T: Send + 'static> {
    result: AtomicU8,
    data: Mutex<Option<T>>,
}

impl<T: Send + 'static> Reporter<T> {
    /// 创建空回报器
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            result: AtomicU8::new(SonResult::Pending as u8),
            data: Mutex::new(None),
        })
    }

    /// 创建预置数据的回报器
    pub fn with_data(data: T) -> Arc<Self> {
        Arc::new(Self {
            result: AtomicU8::new(SonResult::Pending as u8),
            data: Mutex::new(Some(data)),
        })
    }

    /// 写入数据槽
    pub fn set_data(&self, data: T) {
        *self.data.lock() = Some(data);
    }

    /// 取走数据槽内容
    pub fn take_data(&self) -> Option<T> {
        self.data.lock().take()
    }

    /// 检查是否仍未出结果
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.result() == SonResult::Pending
    }
}

impl<T: Send + 'static> ReporterBase for Reporter<T> {
    fn set_result(&self, result: SonResult) {
        // 只允许 Pending -> 终态，失败即已有结果，保持不变
        let _ = self.result.compare_exchange(
            SonResult::Pending as u8,
            result as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    #[inline]
    fn result(&self) -> SonResult {
        SonResult::from(self.result.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_initial_pending() {
        let r = Reporter::<i32>::new();
        assert!(r.is_pending());
        assert_eq!(r.result(), SonResult::Pending);
        assert_eq!(r.take_data(), None);
    }

    #[test]
    fn test_reporter_result_monotone() {
        let r = Reporter::<i32>::new();
        r.set_result(SonResult::Done);
        assert_eq!(r.result(), SonResult::Done);

        // 结果已定，后续写入不生效
        r.set_result(SonResult::Timeout);
        assert_eq!(r.result(), SonResult::Done);
        r.set_result(SonResult::Error);
        assert_eq!(r.result(), SonResult::Done);
    }

    #[test]
    fn test_reporter_data_slot() {
        let r = Reporter::with_data(41);
        assert_eq!(r.take_data(), Some(41));
        assert_eq!(r.take_data(), None);

        r.set_data(7);
        assert_eq!(r.take_data(), Some(7));
    }

    #[test]
    fn test_son_result_from_u8() {
        assert_eq!(SonResult::from(0), SonResult::Pending);
        assert_eq!(SonResult::from(1), SonResult::Done);
        assert_eq!(SonResult::from(2), SonResult::Timeout);
        assert_eq!(SonResult::from(3), SonResult::Error);
        assert_eq!(SonResult::from(200), SonResult::Error);
    }
}
