//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!
//! Slab 分配器（对象缓存）
//!
//! 把伙伴系统给出的页切成定长对象槽位，用于小对象的高效分配。
//!
//! # 设计
//! - SlabCache: 管理某个对象大小的缓存
//! - Slab: 一块连续页，切成槽位，槽内空闲链用"下一个槽位索引"表示
//! - 快速路径：每 CPU 一个"当前 slab"游标，槽内空闲链头是
//!   (代数, 头索引) 打包的原子字，CAS 推进。代数每次成功操作
//!   递增：被抢占后迁移到其他处理器继续执行的操作会 CAS 失败
//!   并重试，而不是损坏链表（同时免疫 ABA）
//! - 慢速路径：当前 slab 耗尽时加缓存锁，从 partial 池取或向
//!   伙伴系统要新页
//!
//! 释放让 full slab 变 partial 时移回 partial 池；让 partial
//! 变全空时把页还给伙伴系统（保留 min_partial 个避免抖动）。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::config::{MAX_CPUS, PAGE_SIZE, SLAB_MIN_PARTIAL};
use crate::error::AllocError;
use crate::page::Pfn;

/// 对象缓存句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHandle(pub(crate) usize);

/// 对象引用：所属 slab 与槽位索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub(crate) slab: u32,
    pub(crate) index: u32,
}

/// 槽内空闲链的结束标记
const SLOT_NIL: u32 = u32::MAX;
/// 已分配槽位的哨兵值（检测对象重复释放）
const SLOT_BUSY: u32 = u32::MAX - 1;

/// 最小对象大小
const MIN_OBJECT_SIZE: usize = 8;
/// 最大对象大小（一个最大 slab 能放下）
const MAX_OBJECT_SIZE: usize = PAGE_SIZE * 8;

/// slab 页的提供方（由分配器上下文实现）
pub(crate) trait SlabBacking {
    fn grab_pages(&self, order: usize) -> Result<Pfn, AllocError>;
    fn return_pages(&self, pfn: Pfn, order: usize);
}

/// 一块切好槽位的连续页
pub(crate) struct Slab {
    id: u32,
    base_pfn: Pfn,
    /// 页数 = 2^order
    order: usize,
    capacity: u32,
    /// (代数 << 32) | 空闲链头索引
    freelist: AtomicU64,
    /// 槽内空闲链：next_slot[i] = 下一个空闲槽位
    next_slot: Vec<AtomicU32>,
    /// 已分配对象数
    inuse: AtomicU32,
}

impl Slab {
    fn new(id: u32, base_pfn: Pfn, order: usize, capacity: u32) -> Self {
        let mut next_slot = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let next = if i + 1 < capacity { i + 1 } else { SLOT_NIL };
            next_slot.push(AtomicU32::new(next));
        }
        Self {
            id,
            base_pfn,
            order,
            capacity,
            freelist: AtomicU64::new(0),
            next_slot,
            inuse: AtomicU32::new(0),
        }
    }

    #[inline]
    fn inuse(&self) -> u32 {
        self.inuse.load(Ordering::Acquire)
    }

    /// CAS 弹出一个空闲槽位
    ///
    /// 失败（竞争）就重试；链空返回 None。
    fn try_pop(&self) -> Option<u32> {
        loop {
            let cur = self.freelist.load(Ordering::Acquire);
            let head = cur as u32;
            if head == SLOT_NIL {
                return None;
            }
            let next = self.next_slot[head as usize].load(Ordering::Acquire);
            let gen = (cur >> 32).wrapping_add(1);
            let new = (gen << 32) | next as u64;
            if self
                .freelist
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.next_slot[head as usize].store(SLOT_BUSY, Ordering::Release);
                self.inuse.fetch_add(1, Ordering::AcqRel);
                return Some(head);
            }
        }
    }

    /// 把槽位推回空闲链，返回释放前的 inuse
    fn push(&self, slot: u32) -> u32 {
        if self.next_slot[slot as usize].load(Ordering::Acquire) != SLOT_BUSY {
            panic!(
                "DoubleFreeDetected: slab {} slot {} is already free",
                self.id, slot
            );
        }
        loop {
            let cur = self.freelist.load(Ordering::Acquire);
            let head = cur as u32;
            self.next_slot[slot as usize].store(head, Ordering::Release);
            let gen = (cur >> 32).wrapping_add(1);
            let new = (gen << 32) | slot as u64;
            if self
                .freelist
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self.inuse.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// partial/full 池（缓存锁保护）
struct PoolLists {
    partial: Vec<u32>,
    full: Vec<u32>,
}

/// 对象缓存
pub struct SlabCache {
    /// 对象大小（对齐后）
    object_size: usize,
    /// 每个 slab 的页 order
    slab_order: usize,
    /// 每个 slab 可容纳的对象数
    objects_per_slab: u32,
    /// 保留的最少 partial slab 数
    min_partial: usize,
    /// slab 表（id -> slab，读多写少）
    slabs: RwLock<Vec<Option<Arc<Slab>>>>,
    /// 每 CPU 的当前 slab 游标
    cpu_slab: Vec<Mutex<Option<Arc<Slab>>>>,
    /// partial/full 池
    pool: Mutex<PoolLists>,
    /// 统计：分配次数
    alloc_count: AtomicUsize,
    /// 统计：释放次数
    free_count: AtomicUsize,
}

impl SlabCache {
    /// 创建对象缓存
    ///
    /// slab 的 order 取能放下至少 8 个对象的最小值（上限 3）。
    pub(crate) fn new(object_size: usize) -> Result<Self, AllocError> {
        if object_size == 0 {
            return Err(AllocError::OutOfMemory);
        }
        let object_size = object_size.max(MIN_OBJECT_SIZE).next_multiple_of(8);
        if object_size > MAX_OBJECT_SIZE {
            return Err(AllocError::OutOfMemory);
        }

        let mut slab_order = 0;
        while slab_order < 3 && (PAGE_SIZE << slab_order) / object_size < 8 {
            slab_order += 1;
        }
        let objects_per_slab = ((PAGE_SIZE << slab_order) / object_size).max(1) as u32;

        let mut cpu_slab = Vec::with_capacity(MAX_CPUS);
        for _ in 0..MAX_CPUS {
            cpu_slab.push(Mutex::new(None));
        }

        Ok(Self {
            object_size,
            slab_order,
            objects_per_slab,
            min_partial: SLAB_MIN_PARTIAL,
            slabs: RwLock::new(Vec::new()),
            cpu_slab,
            pool: Mutex::new(PoolLists {
                partial: Vec::new(),
                full: Vec::new(),
            }),
            alloc_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// 分配一个对象
    pub(crate) fn alloc<B: SlabBacking>(
        &self,
        backing: &B,
        cpu: usize,
    ) -> Result<ObjRef, AllocError> {
        let cpu = cpu % self.cpu_slab.len();

        // 快速路径：当前 slab 的空闲链 CAS 弹出
        {
            let slot = self.cpu_slab[cpu].lock();
            if let Some(slab) = slot.as_ref() {
                if let Some(index) = slab.try_pop() {
                    self.alloc_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(ObjRef {
                        slab: slab.id,
                        index,
                    });
                }
            }
        }

        // 慢速路径：换 slab
        self.alloc_slow(backing, cpu)
    }

    fn alloc_slow<B: SlabBacking>(&self, backing: &B, cpu: usize) -> Result<ObjRef, AllocError> {
        let mut slot = self.cpu_slab[cpu].lock();
        loop {
            // 可能有并发释放往当前 slab 还了对象，先再试一次
            if let Some(slab) = slot.as_ref() {
                if let Some(index) = slab.try_pop() {
                    self.alloc_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(ObjRef {
                        slab: slab.id,
                        index,
                    });
                }
            }

            // 换 slab：耗尽的当前 slab 挪进 full 池，partial 池里拿一个
            let replacement = {
                let mut pool = self.pool.lock();
                if let Some(old) = slot.take() {
                    pool.full.push(old.id);
                }
                match pool.partial.pop() {
                    Some(id) => {
                        let slabs = self.slabs.read();
                        match slabs.get(id as usize) {
                            Some(Some(slab)) => Some(slab.clone()),
                            // partial 里出现已释放的 id 属于不变量破坏
                            _ => panic!("slab pool corrupted: stale partial id {}", id),
                        }
                    }
                    None => None,
                }
            };

            match replacement {
                Some(slab) => *slot = Some(slab),
                // 池空：向伙伴系统要新页切一个 slab
                None => *slot = Some(self.grow(backing)?),
            }
        }
    }

    /// 新建一个 slab
    fn grow<B: SlabBacking>(&self, backing: &B) -> Result<Arc<Slab>, AllocError> {
        let base_pfn = backing.grab_pages(self.slab_order)?;

        let mut slabs = self.slabs.write();
        let id = slabs.len() as u32;
        let slab = Arc::new(Slab::new(id, base_pfn, self.slab_order, self.objects_per_slab));
        slabs.push(Some(slab.clone()));
        Ok(slab)
    }

    /// 释放一个对象
    pub(crate) fn free<B: SlabBacking>(&self, backing: &B, obj: ObjRef) {
        let slab = {
            let slabs = self.slabs.read();
            match slabs.get(obj.slab as usize) {
                Some(Some(slab)) => slab.clone(),
                _ => panic!("DoubleFreeDetected: object in released slab {}", obj.slab),
            }
        };

        let prev_inuse = slab.push(obj.index);
        self.free_count.fetch_add(1, Ordering::Relaxed);

        // full -> partial
        if prev_inuse == slab.capacity {
            let mut pool = self.pool.lock();
            if let Some(pos) = pool.full.iter().position(|&id| id == slab.id) {
                pool.full.swap_remove(pos);
                pool.partial.push(slab.id);
            }
            // 不在 full 池则它是某个 CPU 的当前 slab，无需挪动
            return;
        }

        // partial -> 全空：超出保留量就把页还给伙伴系统
        if prev_inuse == 1 {
            self.try_release(backing, &slab);
        }
    }

    /// 尝试释放一个全空 slab 的页
    fn try_release<B: SlabBacking>(&self, backing: &B, slab: &Arc<Slab>) {
        let mut pool = self.pool.lock();
        if pool.partial.len() <= self.min_partial {
            return;
        }
        // 持锁重查：只释放仍在 partial 池且确实全空的 slab
        let pos = match pool.partial.iter().position(|&id| id == slab.id) {
            Some(pos) => pos,
            None => return, // 是某个 CPU 的当前 slab，不释放
        };
        if slab.inuse() != 0 {
            return;
        }
        pool.partial.swap_remove(pos);
        self.slabs.write()[slab.id as usize] = None;
        drop(pool);

        backing.return_pages(slab.base_pfn, slab.order);
    }

    /// 收缩缓存：释放所有全空 slab 的页（含 CPU 游标上的）
    pub(crate) fn shrink<B: SlabBacking>(&self, backing: &B) {
        // 先摘下各 CPU 游标
        for slot in &self.cpu_slab {
            let taken = slot.lock().take();
            if let Some(slab) = taken {
                let mut pool = self.pool.lock();
                if slab.inuse() < slab.capacity {
                    pool.partial.push(slab.id);
                } else {
                    pool.full.push(slab.id);
                }
            }
        }

        // 再清空两个池中的全空 slab（full 池里也可能躺着
        // 分配竞争时短暂误判的空 slab）
        let mut released = Vec::new();
        {
            let mut pool = self.pool.lock();
            let mut slabs = self.slabs.write();
            let mut sweep = |ids: &mut Vec<u32>| {
                ids.retain(|&id| {
                    let keep = match slabs.get(id as usize) {
                        Some(Some(slab)) if slab.inuse() == 0 => {
                            released.push((slab.base_pfn, slab.order));
                            false
                        }
                        _ => true,
                    };
                    if !keep {
                        slabs[id as usize] = None;
                    }
                    keep
                });
            };
            sweep(&mut pool.partial);
            sweep(&mut pool.full);
        }
        for (pfn, order) in released {
            backing.return_pages(pfn, order);
        }
    }

    /// 缓存统计快照
    pub fn stats(&self) -> CacheStats {
        // 先数 CPU 游标再拿池锁，和分配路径保持同一锁序
        let cpu_active = self
            .cpu_slab
            .iter()
            .filter(|slot| slot.lock().is_some())
            .count();
        let pool = self.pool.lock();
        let live_slabs = self
            .slabs
            .read()
            .iter()
            .filter(|entry| entry.is_some())
            .count();
        CacheStats {
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab as usize,
            partial_slabs: pool.partial.len(),
            full_slabs: pool.full.len(),
            cpu_active_slabs: cpu_active,
            live_slabs,
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub cpu_active_slabs: usize,
    pub live_slabs: usize,
    pub alloc_count: usize,
    pub free_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    /// 测试桩：从一个递增计数器"分配"页
    struct FakeBacking {
        next_pfn: AtomicUsize,
        outstanding: AtomicUsize,
    }

    impl FakeBacking {
        fn new() -> Self {
            Self {
                next_pfn: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
            }
        }
    }

    impl SlabBacking for FakeBacking {
        fn grab_pages(&self, order: usize) -> Result<Pfn, AllocError> {
            self.outstanding.fetch_add(1 << order, Ordering::Relaxed);
            Ok(self.next_pfn.fetch_add(1 << order, Ordering::Relaxed))
        }

        fn return_pages(&self, _pfn: Pfn, order: usize) {
            self.outstanding.fetch_sub(1 << order, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_object_size_rounding() {
        let cache = SlabCache::new(60).unwrap();
        assert_eq!(cache.object_size(), 64);
        let cache = SlabCache::new(1).unwrap();
        assert_eq!(cache.object_size(), 8);
        assert!(SlabCache::new(MAX_OBJECT_SIZE * 2).is_err());
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let backing = FakeBacking::new();
        let cache = SlabCache::new(64).unwrap();

        let a = cache.alloc(&backing, 0).unwrap();
        let b = cache.alloc(&backing, 0).unwrap();
        assert_ne!(a, b);

        cache.free(&backing, a);
        cache.free(&backing, b);

        let stats = cache.stats();
        assert_eq!(stats.alloc_count, 2);
        assert_eq!(stats.free_count, 2);
    }

    #[test]
    fn test_no_duplicate_objects() {
        let backing = FakeBacking::new();
        let cache = SlabCache::new(64).unwrap();

        let mut seen = alloc::vec::Vec::new();
        for _ in 0..200 {
            let obj = cache.alloc(&backing, 0).unwrap();
            assert!(!seen.contains(&obj), "object {:?} handed out twice", obj);
            seen.push(obj);
        }
        for obj in seen {
            cache.free(&backing, obj);
        }
    }

    #[test]
    #[should_panic(expected = "DoubleFreeDetected")]
    fn test_object_double_free() {
        let backing = FakeBacking::new();
        let cache = SlabCache::new(64).unwrap();
        let obj = cache.alloc(&backing, 0).unwrap();
        cache.free(&backing, obj);
        cache.free(&backing, obj);
    }

    #[test]
    fn test_shrink_releases_empty_slabs() {
        let backing = FakeBacking::new();
        let cache = SlabCache::new(64).unwrap();
        let before = cache.stats();
        assert_eq!(before.partial_slabs, 0);

        // 填满几个 slab 再全部释放
        let per_slab = cache.objects_per_slab as usize;
        let mut objs = alloc::vec::Vec::new();
        for _ in 0..per_slab * 3 {
            objs.push(cache.alloc(&backing, 0).unwrap());
        }
        for obj in objs {
            cache.free(&backing, obj);
        }

        cache.shrink(&backing);
        let after = cache.stats();
        assert_eq!(after.partial_slabs, before.partial_slabs);
        assert_eq!(after.live_slabs, 0);
        assert_eq!(backing.outstanding.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let backing = StdArc::new(FakeBacking::new());
        let cache = StdArc::new(SlabCache::new(64).unwrap());

        let mut handles = Vec::new();
        for cpu in 0..4 {
            let backing = backing.clone();
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                let mut held = alloc::vec::Vec::new();
                for i in 0..2500usize {
                    held.push(cache.alloc(&*backing, cpu).unwrap());
                    // 交错释放制造 full/partial 往返
                    if i % 3 == 0 {
                        if let Some(obj) = held.pop() {
                            cache.free(&*backing, obj);
                        }
                    }
                }
                for obj in held {
                    cache.free(&*backing, obj);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.alloc_count, stats.free_count);

        cache.shrink(&*backing);
        assert_eq!(cache.stats().live_slabs, 0);
        assert_eq!(backing.outstanding.load(Ordering::Relaxed), 0);
    }
}
