use std::sync::Arc;

use crate::ibv::*;
use crate::Result;

/// Device-scoped asynchronous event callback.
///
/// Handlers run in the provider's event context and must not block.
pub type EventHandler = Arc<dyn Fn(&AsyncEvent) + Send + Sync>;

/// The hardware interface the link layer is written against.
///
/// Every call may block except the event handlers the provider invokes. Implementations must be
/// callable from any thread.
pub trait Verbs: Send + Sync {
    /// Devices currently present.
    fn devices(&self) -> Result<Vec<DeviceHandle>>;

    fn query_device(&self, dev: DeviceHandle) -> Result<DeviceAttr>;

    /// Ports are numbered from 1.
    fn query_port(&self, dev: DeviceHandle, port: u8) -> Result<PortAttr>;

    fn query_gid(&self, dev: DeviceHandle, port: u8, index: u32) -> Result<GidEntry>;

    fn create_cq(&self, dev: DeviceHandle, attr: &CqInitAttr) -> Result<CompletionQueue>;

    fn destroy_cq(&self, cq: CompletionQueue) -> Result<()>;

    /// Arm the CQ so the next completion of the requested kind raises a notification.
    fn req_notify_cq(&self, cq: CompletionQueue, notify: CqNotify) -> Result<()>;

    fn register_event_handler(
        &self,
        dev: DeviceHandle,
        handler: EventHandler,
    ) -> Result<EventHandlerToken>;

    fn unregister_event_handler(&self, token: EventHandlerToken) -> Result<()>;

    fn alloc_pd(&self, dev: DeviceHandle) -> Result<ProtectionDomain>;

    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<()>;

    fn create_qp(&self, pd: ProtectionDomain, attr: QpInitAttr) -> Result<QueuePair>;

    fn destroy_qp(&self, qp: QueuePair) -> Result<()>;

    fn modify_qp(&self, qp: QueuePair, attr: &QpAttr, mask: QpAttrMask) -> Result<()>;

    fn query_qp(&self, qp: QueuePair) -> Result<QpAttr>;

    fn post_recv(&self, qp: QueuePair, wr: &RecvWr) -> Result<()>;

    /// Map `sgl` for DMA, filling in each element's DMA span.
    ///
    /// Returns the number of mapped elements; zero means the mapping failed.
    fn dma_map_sg(&self, dev: DeviceHandle, sgl: &mut [SgEntry], dir: DmaDirection) -> usize;

    fn dma_unmap_sg(&self, dev: DeviceHandle, sgl: &mut [SgEntry], dir: DmaDirection);

    fn dma_sync_single_for_cpu(&self, dev: DeviceHandle, addr: u64, len: u32, dir: DmaDirection);

    fn dma_sync_single_for_device(
        &self,
        dev: DeviceHandle,
        addr: u64,
        len: u32,
        dir: DmaDirection,
    );

    /// Allocate a fast-registration memory region able to hold `max_num_sg` pages.
    fn alloc_mr(&self, pd: ProtectionDomain, max_num_sg: u32) -> Result<MemoryRegion>;

    /// Map the largest DMA-mapped prefix of `sgl` that fits into `mr`.
    ///
    /// Returns the number of elements mapped.
    fn map_mr_sg(&self, mr: MemoryRegion, sgl: &[SgEntry], page_size: usize) -> Result<usize>;

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<()>;
}
