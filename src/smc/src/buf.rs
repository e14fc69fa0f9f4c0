//! Buffers handed to the device: DMA mapping, cache syncs and memory-region registration.
//!
//! A buffer's size is `SMC_BUF_MIN_SIZE << size_class`. Its scatter-gather table lists the CPU
//! spans backing it; after mapping each entry also carries the DMA span the device sees.
//!
//! A buffer is mapped for one device in one direction at a time. It remembers both, so it can be
//! unmapped after the link it was prepared on is gone.
use std::sync::Arc;

use memmap2::MmapMut;
use rdma::{AccessFlags, DeviceHandle, DmaDirection, MemoryRegion, ProtectionDomain, SgEntry, Verbs};

use crate::config::{SMC_BUF_MIN_SIZE, SMC_PAGE_SIZE, SMC_RMBE_SIZES};
use crate::ib::SmcIb;
use crate::link::{LinkRef, PdRef};
use crate::{Error, Result};

/// Size class of the smallest buffer holding `size` bytes, capped at the largest class.
pub fn compress_bufsize(size: usize) -> u8 {
    let units = size.saturating_sub(1) / SMC_BUF_MIN_SIZE;
    let class = (usize::BITS - units.leading_zeros()) as u8;
    class.min(SMC_RMBE_SIZES - 1)
}

/// Buffer size in bytes of `size_class`.
#[inline]
pub fn uncompress_bufsize(size_class: u8) -> usize {
    SMC_BUF_MIN_SIZE << size_class
}

#[derive(Debug, Default)]
pub struct SgTable {
    pub(crate) sgl: Vec<SgEntry>,
    /// Entries describing the buffer.
    pub(crate) orig_nents: usize,
    /// Entries the last DMA mapping produced.
    pub(crate) nents: usize,
}

impl SgTable {
    #[inline]
    pub fn entries(&self) -> &[SgEntry] {
        &self.sgl
    }

    #[inline]
    pub fn orig_nents(&self) -> usize {
        self.orig_nents
    }

    #[inline]
    pub fn nents(&self) -> usize {
        self.nents
    }

    #[inline]
    fn is_dma_mapped(&self) -> bool {
        self.sgl.first().map_or(false, |e| e.dma_address != 0)
    }
}

/// A send or receive buffer of a connection.
#[derive(Debug)]
pub struct BufferSlot {
    chunks: Vec<MmapMut>,
    sgt: SgTable,
    size_class: u8,
    order: u32,
    /// Device and direction of the current DMA mapping.
    dma: Option<(DeviceHandle, DmaDirection)>,
    mr: Option<MemoryRegion>,
    mr_access: AccessFlags,
    /// The domain `mr` lives in, kept until the region is deregistered.
    mr_pd: Option<Arc<PdRef>>,
}

impl BufferSlot {
    /// A buffer of `size_class` backed by one contiguous mapping.
    pub fn alloc(size_class: u8) -> Result<Self> {
        Self::alloc_fragmented(size_class, 1)
    }

    /// A buffer of `size_class` backed by `parts` separate, equally sized mappings.
    pub fn alloc_fragmented(size_class: u8, parts: usize) -> Result<Self> {
        if size_class >= SMC_RMBE_SIZES {
            return Err(Error::BufferSize(size_class));
        }
        let size = uncompress_bufsize(size_class);
        let pages = size / SMC_PAGE_SIZE;
        if parts == 0 || pages % parts != 0 {
            return Err(Error::BufferSize(size_class));
        }
        let part_len = size / parts;

        let mut chunks = Vec::with_capacity(parts);
        let mut sgl = Vec::with_capacity(parts);
        for _ in 0..parts {
            let chunk = MmapMut::map_anon(part_len).map_err(Error::Alloc)?;
            sgl.push(SgEntry {
                addr: chunk.as_ptr() as u64,
                length: part_len as u32,
                ..Default::default()
            });
            chunks.push(chunk);
        }
        Ok(BufferSlot {
            chunks,
            sgt: SgTable {
                sgl,
                orig_nents: parts,
                nents: 0,
            },
            size_class,
            order: pages.trailing_zeros(),
            dma: None,
            mr: None,
            mr_access: AccessFlags::empty(),
            mr_pd: None,
        })
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        uncompress_bufsize(self.size_class)
    }

    #[inline]
    pub fn size_class(&self) -> u8 {
        self.size_class
    }

    /// log2 of the number of pages.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[inline]
    pub fn sg_table(&self) -> &SgTable {
        &self.sgt
    }

    #[inline]
    pub fn is_dma_mapped(&self) -> bool {
        self.sgt.is_dma_mapped()
    }

    #[inline]
    pub fn dma_direction(&self) -> Option<DmaDirection> {
        self.dma.map(|(_, dir)| dir)
    }

    #[inline]
    pub fn dma_device(&self) -> Option<DeviceHandle> {
        self.dma.map(|(dev, _)| dev)
    }

    #[inline]
    pub fn mr(&self) -> Option<MemoryRegion> {
        self.mr
    }

    #[inline]
    pub fn mr_access(&self) -> AccessFlags {
        self.mr_access
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| &c[..])
    }

    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.chunks.iter_mut().map(|c| &mut c[..])
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        if self.is_dma_mapped() || self.mr.is_some() {
            tracing::warn!(
                "buffer of class {} dropped while still mapped (mr: {:?})",
                self.size_class,
                self.mr
            );
        }
    }
}

fn check_mapping(buf: &BufferSlot, dev: DeviceHandle, dir: DmaDirection) -> Result<()> {
    match buf.dma {
        Some((mapped_dev, mapped_dir)) if (mapped_dev, mapped_dir) != (dev, dir) => {
            Err(Error::DmaMismatch {
                device: mapped_dev,
                dir: mapped_dir,
            })
        }
        _ => Ok(()),
    }
}

/// DMA-map the buffer for `dev`. Mapping again for the same device and direction returns the
/// existing count; a buffer mapped differently is refused with `DmaMismatch`.
pub fn map_for_dma(
    verbs: &dyn Verbs,
    dev: DeviceHandle,
    buf: &mut BufferSlot,
    dir: DmaDirection,
) -> Result<usize> {
    check_mapping(buf, dev, dir)?;
    if buf.sgt.is_dma_mapped() {
        return Ok(buf.sgt.nents);
    }
    let mapped = verbs.dma_map_sg(dev, &mut buf.sgt.sgl, dir);
    if mapped == 0 {
        return Err(Error::NoDmaSegments);
    }
    buf.sgt.nents = mapped;
    buf.dma = Some((dev, dir));
    Ok(mapped)
}

/// Undo `map_for_dma`. A buffer that is not mapped is left alone; one mapped for another device
/// or direction is refused with `DmaMismatch`.
pub fn unmap_for_dma(
    verbs: &dyn Verbs,
    dev: DeviceHandle,
    buf: &mut BufferSlot,
    dir: DmaDirection,
) -> Result<()> {
    check_mapping(buf, dev, dir)?;
    unmap_recorded(verbs, buf);
    Ok(())
}

/// Unmap with the device and direction the buffer was mapped with.
fn unmap_recorded(verbs: &dyn Verbs, buf: &mut BufferSlot) {
    let (dev, dir) = match buf.dma.take() {
        Some(mapping) if buf.sgt.is_dma_mapped() => mapping,
        _ => return,
    };
    verbs.dma_unmap_sg(dev, &mut buf.sgt.sgl, dir);
    for e in buf.sgt.sgl.iter_mut() {
        e.dma_address = 0;
        e.dma_length = 0;
    }
    buf.sgt.nents = 0;
}

/// Register the buffer's DMA mapping as a single memory region of `pd`.
///
/// Does nothing if the buffer already has a region. The mapping must form one contiguous DMA
/// segment; otherwise the region is released again and `FragmentedRegion` returned.
pub fn register_memory_region(
    verbs: &dyn Verbs,
    pd: ProtectionDomain,
    access: AccessFlags,
    buf: &mut BufferSlot,
) -> Result<()> {
    if buf.mr.is_some() {
        return Ok(());
    }
    let mr = verbs.alloc_mr(pd, 1 << buf.order).map_err(Error::AllocMr)?;
    let res = verbs.map_mr_sg(mr, &buf.sgt.sgl[..buf.sgt.orig_nents], SMC_PAGE_SIZE);
    if let Ok(1) = res {
        buf.mr = Some(mr);
        buf.mr_access = access;
        return Ok(());
    }
    if let Err(e) = verbs.dereg_mr(mr) {
        tracing::warn!("dereg_mr {:?}: {}", mr, e);
    }
    match res {
        Ok(mapped) => Err(Error::FragmentedRegion { mapped }),
        Err(e) => Err(Error::Verbs(e)),
    }
}

/// Deregister the buffer's memory region, if it has one.
///
/// Drops the buffer's hold on the region's domain afterwards, which frees the domain if its link
/// is already gone.
pub fn put_memory_region(verbs: &dyn Verbs, buf: &mut BufferSlot) {
    if let Some(mr) = buf.mr.take() {
        if let Err(e) = verbs.dereg_mr(mr) {
            tracing::warn!("dereg_mr {:?}: {}", mr, e);
        }
        buf.mr_access = AccessFlags::empty();
    }
    buf.mr_pd = None;
}

fn mapped_entries(buf: &BufferSlot) -> impl Iterator<Item = &SgEntry> {
    buf.sgt
        .sgl
        .iter()
        .take(buf.sgt.nents)
        .take_while(|e| e.dma_length != 0)
}

/// Hand the mapped entries back to the CPU after the device wrote them. Returns how many entries
/// were synced.
pub fn sync_for_cpu(verbs: &dyn Verbs, dev: DeviceHandle, buf: &BufferSlot, dir: DmaDirection) -> usize {
    let mut synced = 0;
    for e in mapped_entries(buf) {
        verbs.dma_sync_single_for_cpu(dev, e.dma_address, e.dma_length, dir);
        synced += 1;
    }
    synced
}

/// Hand the mapped entries to the device after the CPU wrote them.
pub fn sync_for_device(
    verbs: &dyn Verbs,
    dev: DeviceHandle,
    buf: &BufferSlot,
    dir: DmaDirection,
) -> usize {
    let mut synced = 0;
    for e in mapped_entries(buf) {
        verbs.dma_sync_single_for_device(dev, e.dma_address, e.dma_length, dir);
        synced += 1;
    }
    synced
}

impl SmcIb {
    fn dma_target(&self, link: LinkRef) -> Result<(DeviceHandle, Arc<PdRef>)> {
        let (device, pd) = self
            .inner
            .lgr(link.lgr)?
            .with_link(link.link, |l| (l.device, Arc::clone(&l.pd)))?;
        Ok((self.inner.devices.get(device)?.handle, pd))
    }

    pub fn allocate_buffer(&self, size_class: u8) -> Result<BufferSlot> {
        BufferSlot::alloc(size_class)
    }

    /// Make `buf` usable by `link`'s device: DMA-map it and, when `remote_access` is given,
    /// register it as a memory region the peer can target.
    ///
    /// If registration fails the mapping is undone.
    pub fn prepare_buffer(
        &self,
        link: LinkRef,
        buf: &mut BufferSlot,
        dir: DmaDirection,
        remote_access: Option<AccessFlags>,
    ) -> Result<()> {
        let (dev, pd) = self.dma_target(link)?;
        let verbs = &*self.inner.verbs;
        map_for_dma(verbs, dev, buf, dir)?;
        if let Some(access) = remote_access {
            if let Err(e) = register_memory_region(verbs, pd.pd, access, buf) {
                unmap_recorded(verbs, buf);
                return Err(e);
            }
            if buf.mr_pd.is_none() {
                buf.mr_pd = Some(pd);
            }
        }
        Ok(())
    }

    /// Release what `prepare_buffer` set up and free the memory.
    ///
    /// Works after the buffer's link or its whole group is gone: the buffer knows the device it
    /// was mapped for and keeps its region's domain alive until here.
    pub fn release_buffer(&self, mut buf: BufferSlot) {
        let verbs = &*self.inner.verbs;
        put_memory_region(verbs, &mut buf);
        unmap_recorded(verbs, &mut buf);
    }

    /// Sync the buffer for the CPU on the device it is mapped for. Returns the entries synced.
    pub fn sync_buffer_for_cpu(&self, buf: &BufferSlot) -> usize {
        buf.dma
            .map_or(0, |(dev, dir)| sync_for_cpu(&*self.inner.verbs, dev, buf, dir))
    }

    pub fn sync_buffer_for_device(&self, buf: &BufferSlot) -> usize {
        buf.dma
            .map_or(0, |(dev, dir)| sync_for_device(&*self.inner.verbs, dev, buf, dir))
    }
}
