//! Network buffer pool.
//!
//! Buffers live in one arena owned by the stack context and are addressed by
//! `BufHandle`. Each interface gets three fixed-size pools (rx-large,
//! tx-large, tx-small) carved from that arena when it is added. List links
//! and fragment-chain links are handles, never pointers.
//!
//! Nothing here locks: every call site already holds the stack lock.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use smoltcp::wire::{IpProtocol, Ipv6Address};

use super::IfNbr;
use crate::config::IfBufCfg;
use crate::error::{NetError, NetResult};

/// Arena index of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufHandle(u16);

impl BufHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufType {
    RxLarge,
    TxLarge,
    TxSmall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufDir {
    Rx,
    Tx,
}

/// Intrusive lists a buffer can sit on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufList {
    Prim,
    Sec,
    Tx,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufFlags: u16 {
        const USED         = 0x0001;
        const CLR_MEM      = 0x0002;
        const RX_BROADCAST = 0x0010;
        const RX_MULTICAST = 0x0020;
        const TX_BROADCAST = 0x0040;
        const TX_MULTICAST = 0x0080;
        const TX_LOCK      = 0x0100;
        const IPV6_FRAME   = 0x0200;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufLinks {
    pub prev: Option<BufHandle>,
    pub next: Option<BufHandle>,
}

/// Per-buffer header. Lengths named `*_tot_len`, `*_msg_len` and
/// `ip_datagram_len` describe the whole datagram and are duplicated into
/// every link of a chain; `data_ix`/`data_len` describe this link's slice.
#[derive(Clone, Copy, Debug)]
pub struct BufHdr {
    pub id: u16,
    pub ref_ctr: u8,
    pub flags: BufFlags,
    pub if_nbr: IfNbr,
    pub if_nbr_tx: IfNbr,

    pub prim: BufLinks,
    pub sec: BufLinks,
    pub tx: BufLinks,
    pub next_buf: Option<BufHandle>,
    pub prev_buf: Option<BufHandle>,

    pub tot_len: usize,
    pub data_ix: usize,
    pub data_len: usize,

    pub ip_hdr_ix: usize,
    pub ip_hdr_len: usize,
    /// IPv6 payload length of the datagram as received
    pub ip_tot_len: usize,
    /// Upper-layer length after extension headers
    pub ip_datagram_len: usize,
    pub ip_next_hdr: IpProtocol,
    pub ip_addr_src: Ipv6Address,
    pub ip_addr_dst: Ipv6Address,
    pub ip_frag_offset: u16,
    pub ip_frag_more: bool,

    pub icmp_msg_ix: usize,
    pub icmp_msg_len: usize,
    pub icmp_hdr_len: usize,
}

impl BufHdr {
    pub const fn new() -> Self {
        Self {
            id: 0,
            ref_ctr: 0,
            flags: BufFlags::empty(),
            if_nbr: 0,
            if_nbr_tx: 0,
            prim: BufLinks { prev: None, next: None },
            sec: BufLinks { prev: None, next: None },
            tx: BufLinks { prev: None, next: None },
            next_buf: None,
            prev_buf: None,
            tot_len: 0,
            data_ix: 0,
            data_len: 0,
            ip_hdr_ix: 0,
            ip_hdr_len: 0,
            ip_tot_len: 0,
            ip_datagram_len: 0,
            ip_next_hdr: IpProtocol::Ipv6NoNxt,
            ip_addr_src: Ipv6Address::UNSPECIFIED,
            ip_addr_dst: Ipv6Address::UNSPECIFIED,
            ip_frag_offset: 0,
            ip_frag_more: false,
            icmp_msg_ix: 0,
            icmp_msg_len: 0,
            icmp_hdr_len: 0,
        }
    }

    fn links_mut(&mut self, list: BufList) -> &mut BufLinks {
        match list {
            BufList::Prim => &mut self.prim,
            BufList::Sec => &mut self.sec,
            BufList::Tx => &mut self.tx,
        }
    }

    pub fn links(&self, list: BufList) -> BufLinks {
        match list {
            BufList::Prim => self.prim,
            BufList::Sec => self.sec,
            BufList::Tx => self.tx,
        }
    }
}

impl Default for BufHdr {
    fn default() -> Self {
        Self::new()
    }
}

/// Cleanup run once when a buffer's reference count reaches zero.
pub type UnlinkFn = Box<dyn FnOnce(BufHandle) + Send>;

struct BufEntry {
    hdr: BufHdr,
    typ: BufType,
    size: usize,
    owner_if: IfNbr,
    /// Allocated on first get
    data: Option<Vec<u8>>,
    unlink: Option<UnlinkFn>,
}

/// Usage counters for one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub nbr_total: usize,
    pub nbr_used: usize,
    pub nbr_used_max: usize,
    pub get_fail: u32,
}

struct PoolSet {
    size: usize,
    free: Vec<BufHandle>,
    stats: PoolStats,
}

impl PoolSet {
    fn take(&mut self) -> Option<BufHandle> {
        let h = self.free.pop()?;
        self.stats.nbr_used += 1;
        if self.stats.nbr_used > self.stats.nbr_used_max {
            self.stats.nbr_used_max = self.stats.nbr_used;
        }
        Some(h)
    }

    fn give(&mut self, h: BufHandle) {
        self.stats.nbr_used = self.stats.nbr_used.saturating_sub(1);
        self.free.push(h);
    }
}

struct IfPools {
    rx_large: PoolSet,
    tx_large: PoolSet,
    tx_small: PoolSet,
    seg_size: Option<usize>,
    seg_used: usize,
    clr_mem: bool,
}

impl IfPools {
    fn pool_mut(&mut self, typ: BufType) -> &mut PoolSet {
        match typ {
            BufType::RxLarge => &mut self.rx_large,
            BufType::TxLarge => &mut self.tx_large,
            BufType::TxSmall => &mut self.tx_small,
        }
    }

    fn pool(&self, typ: BufType) -> &PoolSet {
        match typ {
            BufType::RxLarge => &self.rx_large,
            BufType::TxLarge => &self.tx_large,
            BufType::TxSmall => &self.tx_small,
        }
    }
}

/// Buffer arena plus per-interface pools.
pub struct BufPool {
    entries: Vec<BufEntry>,
    ifs: Vec<IfPools>,
    id_ctr: u16,
    free_err: u32,
    unlinks: Vec<(BufHandle, UnlinkFn)>,
}

impl BufPool {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            ifs: Vec::new(),
            id_ctr: 0,
            free_err: 0,
            unlinks: Vec::new(),
        }
    }

    /// Carve the pools for a new interface. Returns its interface number.
    pub fn if_add(&mut self, cfg: &IfBufCfg) -> NetResult<IfNbr> {
        if cfg.rx_large_nbr == 0 || cfg.rx_large_size == 0 || cfg.tx_large_size == 0 {
            return Err(NetError::InvalidArg);
        }
        if cfg.tx_small_nbr > 0 && cfg.tx_small_size > cfg.tx_large_size {
            return Err(NetError::InvalidArg);
        }
        let if_nbr = IfNbr::try_from(self.ifs.len()).map_err(|_| NetError::InvalidArg)?;
        let added = cfg.rx_large_nbr + cfg.tx_large_nbr + cfg.tx_small_nbr;
        if self.entries.len() + added > u16::MAX as usize {
            return Err(NetError::InvalidArg);
        }

        let mut pools = IfPools {
            rx_large: self.carve(if_nbr, BufType::RxLarge, cfg.rx_large_nbr, cfg.rx_large_size),
            tx_large: self.carve(if_nbr, BufType::TxLarge, cfg.tx_large_nbr, cfg.tx_large_size),
            tx_small: self.carve(if_nbr, BufType::TxSmall, cfg.tx_small_nbr, cfg.tx_small_size),
            seg_size: cfg.seg_size,
            seg_used: 0,
            clr_mem: cfg.clr_mem,
        };
        // Pop order hands out the lowest index first
        for set in [&mut pools.rx_large, &mut pools.tx_large, &mut pools.tx_small] {
            set.free.reverse();
        }
        self.ifs.push(pools);

        crate::klog::klog_info(
            "buf",
            &alloc::format!(
                "if {} pools: rx {}x{} tx {}x{} small {}x{}",
                if_nbr,
                cfg.rx_large_nbr,
                cfg.rx_large_size,
                cfg.tx_large_nbr,
                cfg.tx_large_size,
                cfg.tx_small_nbr,
                cfg.tx_small_size
            ),
        );
        Ok(if_nbr)
    }

    fn carve(&mut self, if_nbr: IfNbr, typ: BufType, nbr: usize, size: usize) -> PoolSet {
        let mut free = Vec::with_capacity(nbr);
        for _ in 0..nbr {
            let h = BufHandle(self.entries.len() as u16);
            self.entries.push(BufEntry {
                hdr: BufHdr::new(),
                typ,
                size,
                owner_if: if_nbr,
                data: None,
                unlink: None,
            });
            free.push(h);
        }
        PoolSet {
            size,
            free,
            stats: PoolStats {
                nbr_total: nbr,
                ..PoolStats::default()
            },
        }
    }

    pub fn if_count(&self) -> usize {
        self.ifs.len()
    }

    fn if_pools(&self, if_nbr: IfNbr) -> NetResult<&IfPools> {
        self.ifs.get(if_nbr as usize).ok_or(NetError::InvalidArg)
    }

    fn entry(&self, h: BufHandle) -> NetResult<&BufEntry> {
        self.entries.get(h.index()).ok_or(NetError::InvalidArg)
    }

    fn entry_mut(&mut self, h: BufHandle) -> NetResult<&mut BufEntry> {
        self.entries.get_mut(h.index()).ok_or(NetError::InvalidArg)
    }

    /// Get a buffer able to hold `size` bytes starting at `ix`.
    pub fn get(&mut self, if_nbr: IfNbr, dir: BufDir, size: usize, ix: usize) -> NetResult<BufHandle> {
        let req = size.checked_add(ix).ok_or(NetError::WouldOverflow)?;
        let pools = self.ifs.get_mut(if_nbr as usize).ok_or(NetError::InvalidArg)?;

        let typ = match dir {
            BufDir::Rx => {
                if req > pools.rx_large.size {
                    return Err(NetError::WouldOverflow);
                }
                BufType::RxLarge
            }
            BufDir::Tx => {
                if req <= pools.tx_small.size && !pools.tx_small.free.is_empty() {
                    BufType::TxSmall
                } else if req <= pools.tx_large.size {
                    BufType::TxLarge
                } else {
                    return Err(NetError::WouldOverflow);
                }
            }
        };

        let set = pools.pool_mut(typ);
        let h = match set.take() {
            Some(h) => h,
            None => {
                set.stats.get_fail += 1;
                return Err(NetError::PoolEmpty);
            }
        };

        let blk_size = set.size;
        let clr_mem = pools.clr_mem;
        let needs_blk = self.entries[h.index()].data.is_none();
        if needs_blk {
            if let Some(budget) = pools.seg_size {
                if pools.seg_used + blk_size > budget {
                    let set = pools.pool_mut(typ);
                    set.give(h);
                    set.stats.get_fail += 1;
                    return Err(NetError::SegOverflow);
                }
            }
            pools.seg_used += blk_size;
        }

        self.id_ctr = self.id_ctr.wrapping_add(1);
        let id = self.id_ctr;
        let entry = &mut self.entries[h.index()];
        if needs_blk {
            entry.data = Some(vec![0u8; blk_size]);
        } else if clr_mem {
            if let Some(d) = entry.data.as_mut() {
                d.fill(0);
            }
        }

        entry.hdr = BufHdr::new();
        entry.hdr.id = id;
        entry.hdr.ref_ctr = 1;
        entry.hdr.flags = BufFlags::USED;
        if clr_mem {
            entry.hdr.flags |= BufFlags::CLR_MEM;
        }
        entry.hdr.if_nbr = if_nbr;
        entry.hdr.if_nbr_tx = if_nbr;
        entry.unlink = None;
        Ok(h)
    }

    /// Drop one reference. At zero the buffer leaves every list and goes
    /// back to its pool; its unlink callback is queued for `unlink_drain`.
    /// Chain links are not followed; see `free_chain`.
    pub fn free(&mut self, h: BufHandle) {
        let Some(entry) = self.entries.get_mut(h.index()) else {
            self.free_err += 1;
            return;
        };
        if !entry.hdr.flags.contains(BufFlags::USED) {
            self.free_err += 1;
            crate::klog::klog_debug("buf", &alloc::format!("free of unused buf {}", h.0));
            return;
        }
        if entry.hdr.ref_ctr > 1 {
            entry.hdr.ref_ctr -= 1;
            return;
        }

        for list in [BufList::Prim, BufList::Sec, BufList::Tx] {
            self.list_remove(h, list);
        }

        let entry = &mut self.entries[h.index()];
        let unlink = entry.unlink.take();
        entry.hdr.ref_ctr = 0;
        entry.hdr.flags = BufFlags::empty();
        entry.hdr.next_buf = None;
        entry.hdr.prev_buf = None;
        let typ = entry.typ;
        let owner = entry.owner_if as usize;

        if let Some(f) = unlink {
            self.unlinks.push((h, f));
        }
        if let Some(pools) = self.ifs.get_mut(owner) {
            pools.pool_mut(typ).give(h);
        }
    }

    /// Free every link of a `next_buf` chain starting at `head`.
    pub fn free_chain(&mut self, head: BufHandle) {
        let mut cur = Some(head);
        while let Some(h) = cur {
            cur = self.entries.get(h.index()).and_then(|e| e.hdr.next_buf);
            self.free(h);
        }
    }

    /// Take an additional reference for a second owner.
    pub fn ref_inc(&mut self, h: BufHandle) -> NetResult<()> {
        let entry = self.entry_mut(h)?;
        if !entry.hdr.flags.contains(BufFlags::USED) {
            return Err(NetError::InvalidState);
        }
        entry.hdr.ref_ctr = entry.hdr.ref_ctr.checked_add(1).ok_or(NetError::WouldOverflow)?;
        Ok(())
    }

    /// Unlink callbacks of buffers freed since the last drain, in free order.
    /// Run them once the pool is no longer borrowed.
    pub fn unlink_drain(&mut self) -> Vec<(BufHandle, UnlinkFn)> {
        core::mem::take(&mut self.unlinks)
    }

    pub fn set_unlink(&mut self, h: BufHandle, f: UnlinkFn) -> NetResult<()> {
        self.entry_mut(h)?.unlink = Some(f);
        Ok(())
    }

    pub fn hdr(&self, h: BufHandle) -> NetResult<&BufHdr> {
        Ok(&self.entry(h)?.hdr)
    }

    pub fn hdr_mut(&mut self, h: BufHandle) -> NetResult<&mut BufHdr> {
        Ok(&mut self.entry_mut(h)?.hdr)
    }

    pub fn buf_type(&self, h: BufHandle) -> NetResult<BufType> {
        Ok(self.entry(h)?.typ)
    }

    pub fn size(&self, h: BufHandle) -> NetResult<usize> {
        Ok(self.entry(h)?.size)
    }

    pub fn is_used(&self, h: BufHandle) -> bool {
        self.entries
            .get(h.index())
            .is_some_and(|e| e.hdr.flags.contains(BufFlags::USED))
    }

    /// Bytes writable from `ix` to the end of `buf`, or of the largest
    /// buffer the interface pool for `dir` hands out when `buf` is `None`.
    pub fn max_size(&self, if_nbr: IfNbr, dir: BufDir, buf: Option<BufHandle>, ix: usize) -> usize {
        let size = match buf {
            Some(h) => self.entry(h).map(|e| e.size).unwrap_or(0),
            None => match self.if_pools(if_nbr) {
                Ok(p) => match dir {
                    BufDir::Rx => p.rx_large.size,
                    BufDir::Tx => p.tx_large.size,
                },
                Err(_) => 0,
            },
        };
        size.saturating_sub(ix)
    }

    pub fn pool_stats(&self, if_nbr: IfNbr, typ: BufType) -> NetResult<PoolStats> {
        Ok(self.if_pools(if_nbr)?.pool(typ).stats)
    }

    pub fn free_err_ctr(&self) -> u32 {
        self.free_err
    }

    pub fn data(&self, h: BufHandle) -> NetResult<&[u8]> {
        self.entry(h)?.data.as_deref().ok_or(NetError::InvalidState)
    }

    pub fn data_mut(&mut self, h: BufHandle) -> NetResult<&mut [u8]> {
        self.entry_mut(h)?.data.as_deref_mut().ok_or(NetError::InvalidState)
    }

    /// Raw read at a physical index of one buffer.
    pub fn data_rd(&self, h: BufHandle, ix: usize, out: &mut [u8]) -> NetResult<()> {
        let data = self.data(h)?;
        let end = ix.checked_add(out.len()).ok_or(NetError::WouldOverflow)?;
        let src = data.get(ix..end).ok_or(NetError::WouldOverflow)?;
        out.copy_from_slice(src);
        Ok(())
    }

    /// Raw write at a physical index of one buffer.
    pub fn data_wr(&mut self, h: BufHandle, ix: usize, src: &[u8]) -> NetResult<()> {
        let data = self.data_mut(h)?;
        let end = ix.checked_add(src.len()).ok_or(NetError::WouldOverflow)?;
        let dst = data.get_mut(ix..end).ok_or(NetError::WouldOverflow)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chains
    // ------------------------------------------------------------------

    /// Link `h` after `prev` in a fragment chain.
    pub fn chain_append(&mut self, prev: BufHandle, h: BufHandle) -> NetResult<()> {
        self.entry(h)?;
        self.entry_mut(prev)?.hdr.next_buf = Some(h);
        self.entry_mut(h)?.hdr.prev_buf = Some(prev);
        Ok(())
    }

    pub fn chain_iter(&self, head: BufHandle) -> ChainIter<'_> {
        ChainIter {
            pool: self,
            cur: Some(head),
        }
    }

    pub fn chain_len(&self, head: BufHandle) -> usize {
        self.chain_iter(head).count()
    }

    /// Locate logical payload offset `off` across the data windows
    /// `[data_ix, data_ix + data_len)` of a chain. Returns the link, the
    /// physical index and the bytes left in that link's window.
    fn window_at(&self, head: BufHandle, mut off: usize) -> Option<(BufHandle, usize, usize)> {
        for h in self.chain_iter(head) {
            let hdr = &self.entries[h.index()].hdr;
            if off < hdr.data_len {
                return Some((h, hdr.data_ix + off, hdr.data_len - off));
            }
            off -= hdr.data_len;
        }
        None
    }

    /// Copy `len` payload bytes from chain `src` at logical offset `src_off`
    /// to chain `dst` at logical offset `dst_off`, following `next_buf` on
    /// both sides.
    pub fn data_copy(
        &mut self,
        dst: BufHandle,
        src: BufHandle,
        dst_off: usize,
        src_off: usize,
        len: usize,
    ) -> NetResult<()> {
        let mut tmp = [0u8; 128];
        let mut done = 0;
        while done < len {
            let (sh, six, savail) = self
                .window_at(src, src_off + done)
                .ok_or(NetError::WouldOverflow)?;
            let (dh, dix, davail) = self
                .window_at(dst, dst_off + done)
                .ok_or(NetError::WouldOverflow)?;
            let n = (len - done).min(savail).min(davail).min(tmp.len());
            self.data_rd(sh, six, &mut tmp[..n])?;
            self.data_wr(dh, dix, &tmp[..n])?;
            done += n;
        }
        Ok(())
    }

    /// Write `src` into chain `dst` at logical offset `off`.
    pub fn data_wr_chain(&mut self, dst: BufHandle, off: usize, src: &[u8]) -> NetResult<()> {
        let mut done = 0;
        while done < src.len() {
            let (h, ix, avail) = self.window_at(dst, off + done).ok_or(NetError::WouldOverflow)?;
            let n = (src.len() - done).min(avail);
            self.data_wr(h, ix, &src[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Read from chain `src` at logical offset `off` into `out`.
    pub fn data_rd_chain(&self, src: BufHandle, off: usize, out: &mut [u8]) -> NetResult<()> {
        let mut done = 0;
        while done < out.len() {
            let (h, ix, avail) = self.window_at(src, off + done).ok_or(NetError::WouldOverflow)?;
            let n = (out.len() - done).min(avail);
            self.data_rd(h, ix, &mut out[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Intrusive lists
    // ------------------------------------------------------------------

    /// Insert `h` after `anchor` on `list`.
    pub fn list_insert_after(&mut self, anchor: BufHandle, h: BufHandle, list: BufList) -> NetResult<()> {
        self.entry(h)?;
        let next = self.entry(anchor)?.hdr.links(list).next;
        if let Some(n) = next {
            self.entries[n.index()].hdr.links_mut(list).prev = Some(h);
        }
        let links = self.entries[h.index()].hdr.links_mut(list);
        links.prev = Some(anchor);
        links.next = next;
        self.entries[anchor.index()].hdr.links_mut(list).next = Some(h);
        Ok(())
    }

    /// Splice `h` out of `list`, joining its neighbours.
    pub fn list_remove(&mut self, h: BufHandle, list: BufList) {
        let Some(entry) = self.entries.get_mut(h.index()) else {
            return;
        };
        let links = core::mem::take(entry.hdr.links_mut(list));
        if let Some(p) = links.prev {
            self.entries[p.index()].hdr.links_mut(list).next = links.next;
        }
        if let Some(n) = links.next {
            self.entries[n.index()].hdr.links_mut(list).prev = links.prev;
        }
    }
}

impl Default for BufPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks `next_buf` links.
pub struct ChainIter<'a> {
    pool: &'a BufPool,
    cur: Option<BufHandle>,
}

impl Iterator for ChainIter<'_> {
    type Item = BufHandle;

    fn next(&mut self) -> Option<BufHandle> {
        let h = self.cur?;
        self.cur = self.pool.entries.get(h.index()).and_then(|e| e.hdr.next_buf);
        Some(h)
    }
}
