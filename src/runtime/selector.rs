//! 可轮询对象
//!
//! 注册到工作线程的外部事件源（套接字、定时器等）需要具备的能力

/// 非阻塞轮询能力
///
/// 驱动循环在每轮调度之间依次轮询所有注册对象，总是传入 0 超时。
/// 实现必须有界且不得阻塞、不得挂起
pub trait Selectable: Send + Sync {
    /// 执行至多一轮非阻塞工作，返回处理的事件数
    fn poll(&self, timeout_ms: u64) -> usize;
}
