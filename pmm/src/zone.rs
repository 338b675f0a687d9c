//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! 内存区域 (Zone)
//!
//! 物理内存按节点和区域类型划分，每个区域独立记账空闲页数并
//! 持有 {min, low, high} 三条水位线：
//! - free >= low            正常
//! - min <= free < low      唤醒后台回收
//! - free < min             分配路径内联直接回收
//! - free < min/2           OOM 领域
//!
//! 水位检查刻意是乐观/有竞争的：检查到行动之间状态可能已经变化，
//! 正确性靠每次行动后重新检查，而不是对整个决策持锁。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::{MAX_CPUS, MIGRATE_TYPES, NR_ORDERS};
use crate::list::PageList;
use crate::lru::LruLists;
use crate::page::Pfn;
use crate::pcp::PcpSet;

/// 区域类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ZoneType {
    /// 低端设备可达内存
    Dma = 0,
    /// 常规内存
    Normal = 1,
}

impl ZoneType {
    pub fn name(&self) -> &'static str {
        match self {
            ZoneType::Dma => "DMA",
            ZoneType::Normal => "Normal",
        }
    }
}

/// 区域水位线
///
/// 不变量：min < low < high。数值由两个可调项派生
/// （保留 KB 值与按区域大小缩放的系数），派生公式是策略而非不变量。
#[derive(Debug)]
pub struct Watermarks {
    min: AtomicUsize,
    low: AtomicUsize,
    high: AtomicUsize,
}

impl Watermarks {
    pub const fn zero() -> Self {
        Self {
            min: AtomicUsize::new(0),
            low: AtomicUsize::new(0),
            high: AtomicUsize::new(0),
        }
    }

    pub fn min(&self) -> usize {
        self.min.load(Ordering::Relaxed)
    }

    pub fn low(&self) -> usize {
        self.low.load(Ordering::Relaxed)
    }

    pub fn high(&self) -> usize {
        self.high.load(Ordering::Relaxed)
    }

    pub fn set(&self, min: usize, low: usize, high: usize) {
        debug_assert!(min <= low && low <= high);
        self.min.store(min, Ordering::Relaxed);
        self.low.store(low, Ordering::Relaxed);
        self.high.store(high, Ordering::Relaxed);
    }
}

/// 区域压力等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ZonePressure {
    /// 空闲充足
    Healthy,
    /// 需要后台回收
    BackgroundReclaim,
    /// 分配路径需要内联直接回收
    DirectReclaim,
    /// 回收已不足以自救
    OomTerritory,
}

/// 水位判定（纯函数）
///
/// 分配/释放之后用它决定是否唤醒后台回收；
/// 分配路径内用它决定是否必须先做直接回收。
pub fn classify(free_pages: usize, wm: &Watermarks) -> ZonePressure {
    let min = wm.min();
    if free_pages >= wm.low() {
        ZonePressure::Healthy
    } else if free_pages >= min {
        ZonePressure::BackgroundReclaim
    } else if free_pages >= min / 2 {
        ZonePressure::DirectReclaim
    } else {
        ZonePressure::OomTerritory
    }
}

/// 单个 order 的空闲块集合，按迁移类型二级分链
pub(crate) struct OrderArea {
    pub lists: [PageList; MIGRATE_TYPES],
    /// 本 order 的空闲块数（所有迁移类型之和）
    pub nr_free: usize,
}

impl OrderArea {
    fn new() -> Self {
        Self {
            lists: [PageList::new(), PageList::new(), PageList::new()],
            nr_free: 0,
        }
    }
}

/// 区域的伙伴空闲链表（区域锁保护的全部可变状态）
pub(crate) struct FreeArea {
    pub areas: Vec<OrderArea>,
}

impl FreeArea {
    fn new() -> Self {
        let mut areas = Vec::with_capacity(NR_ORDERS);
        for _ in 0..NR_ORDERS {
            areas.push(OrderArea::new());
        }
        Self { areas }
    }
}

/// 内存区域
pub struct Zone {
    /// 所属节点
    node: usize,
    /// 区域类型
    ztype: ZoneType,
    /// 起始页帧号
    start_pfn: Pfn,
    /// 跨度（页数，可能含空洞）
    span: usize,
    /// 伙伴系统实际管理的页数
    managed_pages: AtomicUsize,
    /// 当前空闲页数（不含 Per-CPU 缓存滞留的页：从区域视角
    /// 它们已被取走，水位检查只读这个计数）
    free_pages: AtomicUsize,
    /// 水位线
    pub watermarks: Watermarks,
    /// 伙伴空闲链表
    pub(crate) freelist: Mutex<FreeArea>,
    /// LRU 链表
    pub(crate) lru: Mutex<LruLists>,
    /// Per-CPU 页缓存（按处理器号索引）
    pub(crate) pcp: Vec<Mutex<PcpSet>>,
}

impl Zone {
    pub(crate) fn new(node: usize, ztype: ZoneType, start_pfn: Pfn, span: usize) -> Self {
        let mut pcp = Vec::with_capacity(MAX_CPUS);
        for _ in 0..MAX_CPUS {
            pcp.push(Mutex::new(PcpSet::new()));
        }
        Self {
            node,
            ztype,
            start_pfn,
            span,
            managed_pages: AtomicUsize::new(0),
            free_pages: AtomicUsize::new(0),
            watermarks: Watermarks::zero(),
            freelist: Mutex::new(FreeArea::new()),
            lru: Mutex::new(LruLists::new()),
            pcp,
        }
    }

    #[inline]
    pub fn node(&self) -> usize {
        self.node
    }

    #[inline]
    pub fn zone_type(&self) -> ZoneType {
        self.ztype
    }

    #[inline]
    pub fn start_pfn(&self) -> Pfn {
        self.start_pfn
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.span
    }

    /// 页帧号是否落在本区域跨度内
    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start_pfn && pfn < self.start_pfn + self.span
    }

    #[inline]
    pub fn managed_pages(&self) -> usize {
        self.managed_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_managed(&self, pages: usize) {
        self.managed_pages.fetch_add(pages, Ordering::Relaxed);
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_free(&self, pages: usize) {
        self.free_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_free(&self, pages: usize) {
        self.free_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    /// 当前压力等级
    pub fn pressure(&self) -> ZonePressure {
        classify(self.free_pages(), &self.watermarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_regions() {
        let wm = Watermarks::zero();
        wm.set(64, 80, 96);

        assert_eq!(classify(200, &wm), ZonePressure::Healthy);
        assert_eq!(classify(80, &wm), ZonePressure::Healthy);
        assert_eq!(classify(79, &wm), ZonePressure::BackgroundReclaim);
        assert_eq!(classify(64, &wm), ZonePressure::BackgroundReclaim);
        assert_eq!(classify(63, &wm), ZonePressure::DirectReclaim);
        assert_eq!(classify(32, &wm), ZonePressure::DirectReclaim);
        assert_eq!(classify(31, &wm), ZonePressure::OomTerritory);
        assert_eq!(classify(0, &wm), ZonePressure::OomTerritory);
    }

    #[test]
    fn test_pressure_order() {
        // 压力等级可比较，升级判断依赖这个顺序
        assert!(ZonePressure::Healthy < ZonePressure::BackgroundReclaim);
        assert!(ZonePressure::BackgroundReclaim < ZonePressure::DirectReclaim);
        assert!(ZonePressure::DirectReclaim < ZonePressure::OomTerritory);
    }

    #[test]
    fn test_zone_counters() {
        let zone = Zone::new(0, ZoneType::Normal, 0, 1024);
        zone.add_managed(1024);
        zone.add_free(1024);
        assert_eq!(zone.free_pages(), 1024);
        zone.sub_free(24);
        assert_eq!(zone.free_pages(), 1000);
        assert!(zone.contains(1023));
        assert!(!zone.contains(1024));
    }
}
