//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! 页描述符 (Page Descriptor)
//!
//! 为每个物理页帧维护元数据，包括：
//! - 引用计数 (_refcount)
//! - 页标志位 (flags)
//! - 迁移类型 (migrate_type)
//! - 空闲/LRU 链表索引 (next/prev)
//!
//! 描述符存放在一个以页帧号为下标的平坦数组 [`MemMap`] 中；
//! 链表用"下一个页帧号"索引表示而不是裸指针，页帧在系统生命周期内
//! 只在"空闲"和"在用"两种角色间回收，从不销毁。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::page::{Pfn, PFN_NIL};

/// 无主页的域标识
pub const DOMAIN_NONE: usize = usize::MAX;

/// 页标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageFlag {
    /// 页已锁定，不可回收/迁移
    Locked = 1 << 0,
    /// 页已修改（需要回写）
    Dirty = 1 << 1,
    /// 页正在回写
    Writeback = 1 << 2,
    /// 页已被访问（用于 LRU 二次机会）
    Referenced = 1 << 3,
    /// 页在 LRU 链表中
    Lru = 1 << 4,
    /// 页在活跃 LRU 链表
    Active = 1 << 5,
    /// 页由交换空间支持（匿名页）
    SwapBacked = 1 << 6,
    /// 页不可驱逐
    Unevictable = 1 << 7,
    /// 伙伴系统空闲块的首页
    Buddy = 1 << 8,
    /// Slab 分配器页
    Slab = 1 << 9,
    /// 保留页（不参与分配）
    Reserved = 1 << 10,
    /// 页在 Per-CPU 缓存中
    Pcp = 1 << 11,
}

/// 页标志位集合
#[derive(Debug, Default)]
pub struct PageFlags(AtomicU32);

impl PageFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// 测试标志位是否设置
    pub fn test(&self, flag: PageFlag) -> bool {
        self.0.load(Ordering::Relaxed) & (flag as u32) != 0
    }

    /// 设置标志位
    pub fn set(&self, flag: PageFlag) {
        self.0.fetch_or(flag as u32, Ordering::Release);
    }

    /// 清除标志位
    pub fn clear(&self, flag: PageFlag) {
        self.0.fetch_and(!(flag as u32), Ordering::Release);
    }

    /// 测试并设置标志位（返回旧值）
    pub fn test_and_set(&self, flag: PageFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_or(bit, Ordering::AcqRel) & bit) != 0
    }

    /// 测试并清除标志位（返回旧值）
    pub fn test_and_clear(&self, flag: PageFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_and(!bit, Ordering::AcqRel) & bit) != 0
    }

    /// 清除所有标志位
    pub fn clear_all(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// 迁移类型
///
/// 按块能否被搬移分类，限制不可移动分配向可移动区域扩散。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MigrateType {
    /// 不可移动（内核使用的页）
    Unmovable = 0,
    /// 可移动（用户页，规整时可迁移）
    Movable = 1,
    /// 可回收（slab 等压力下可释放的页）
    Reclaimable = 2,
}

impl MigrateType {
    pub fn from_index(idx: usize) -> Self {
        match idx {
            1 => MigrateType::Movable,
            2 => MigrateType::Reclaimable,
            _ => MigrateType::Unmovable,
        }
    }

    /// 精确类型的链表为空时的借用顺序
    ///
    /// 优先从"最不易造成污染"的类型偷取，减缓不可移动分配
    /// 在可移动区域中的扩散。
    pub fn fallbacks(&self) -> [MigrateType; 2] {
        match self {
            MigrateType::Unmovable => [MigrateType::Reclaimable, MigrateType::Movable],
            MigrateType::Movable => [MigrateType::Reclaimable, MigrateType::Unmovable],
            MigrateType::Reclaimable => [MigrateType::Unmovable, MigrateType::Movable],
        }
    }
}

/// 页描述符
///
/// 每个物理页帧对应一个 Page 结构体。空闲时归分配器所有，
/// 分配后归持有非零引用计数的子系统所有。
#[repr(C, align(64))]
pub struct Page {
    /// 原子标志位
    flags: PageFlags,

    /// 引用计数：0 表示空闲，> 0 表示在使用
    _refcount: AtomicI32,

    /// 私有数据
    /// - 伙伴系统空闲块首页：存储 order
    /// - 已分配块首页：存储分配时的 order
    /// - Slab 页：存储所属缓存索引
    private: AtomicUsize,

    /// 迁移类型
    migrate: AtomicUsize,

    /// 所属分配域（OOM 记账），DOMAIN_NONE 表示无主
    domain: AtomicUsize,

    /// 链表后继（页帧号索引；伙伴空闲链/PCP 链/LRU 链共用，
    /// 一个页同一时刻至多在一条链上）
    next: AtomicUsize,

    /// 链表前驱
    prev: AtomicUsize,
}

impl Page {
    /// 创建一个新的页描述符（初始化为空闲状态）
    pub const fn new() -> Self {
        Self {
            flags: PageFlags::new(),
            _refcount: AtomicI32::new(0),
            private: AtomicUsize::new(0),
            migrate: AtomicUsize::new(MigrateType::Movable as usize),
            domain: AtomicUsize::new(DOMAIN_NONE),
            next: AtomicUsize::new(PFN_NIL),
            prev: AtomicUsize::new(PFN_NIL),
        }
    }

    /// 初始化为保留页
    pub fn init_reserved(&self) {
        self.flags.set(PageFlag::Reserved);
        self._refcount.store(1, Ordering::Release);
    }

    /// 初始化为普通可用页
    pub fn init_free(&self) {
        self.flags.clear_all();
        self._refcount.store(0, Ordering::Release);
        self.private.store(0, Ordering::Release);
        self.domain.store(DOMAIN_NONE, Ordering::Release);
        self.next.store(PFN_NIL, Ordering::Release);
        self.prev.store(PFN_NIL, Ordering::Release);
    }

    // ========== 标志位操作 ==========

    #[inline]
    pub fn flags(&self) -> &PageFlags {
        &self.flags
    }

    #[inline]
    pub fn test_flag(&self, flag: PageFlag) -> bool {
        self.flags.test(flag)
    }

    #[inline]
    pub fn set_flag(&self, flag: PageFlag) {
        self.flags.set(flag);
    }

    #[inline]
    pub fn clear_flag(&self, flag: PageFlag) {
        self.flags.clear(flag);
    }

    #[inline]
    pub fn is_buddy(&self) -> bool {
        self.test_flag(PageFlag::Buddy)
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.test_flag(PageFlag::Reserved)
    }

    #[inline]
    pub fn is_lru(&self) -> bool {
        self.test_flag(PageFlag::Lru)
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.test_flag(PageFlag::SwapBacked)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.test_flag(PageFlag::Dirty)
    }

    // ========== 引用计数操作 ==========

    /// 获取引用计数
    #[inline]
    pub fn refcount(&self) -> i32 {
        self._refcount.load(Ordering::Acquire)
    }

    /// 增加引用计数，返回增加后的值
    #[inline]
    pub fn get(&self) -> i32 {
        self._refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少引用计数，返回减少前的值。
    ///
    /// 对已经为 0 的页调用即是重复释放：这里 panic 而不是修复，
    /// 静默继续会把同一物理页交给两个所有者。
    #[inline]
    pub fn put(&self) -> i32 {
        let prev = self._refcount.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            panic!("DoubleFreeDetected: refcount {} on free", prev);
        }
        prev
    }

    /// 设置引用计数（仅用于初始化/接管）
    #[inline]
    pub fn set_refcount(&self, count: i32) {
        self._refcount.store(count, Ordering::Release);
    }

    // ========== 私有数据 / 迁移类型 / 域 ==========

    #[inline]
    pub fn private(&self) -> usize {
        self.private.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_private(&self, value: usize) {
        self.private.store(value, Ordering::Release);
    }

    #[inline]
    pub fn migrate_type(&self) -> MigrateType {
        MigrateType::from_index(self.migrate.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_migrate_type(&self, mt: MigrateType) {
        self.migrate.store(mt as usize, Ordering::Relaxed);
    }

    #[inline]
    pub fn domain(&self) -> usize {
        self.domain.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_domain(&self, domain: usize) {
        self.domain.store(domain, Ordering::Release);
    }

    // ========== 链表索引（各链表持锁时访问） ==========

    #[inline]
    pub(crate) fn next(&self) -> Pfn {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, pfn: Pfn) {
        self.next.store(pfn, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn prev(&self) -> Pfn {
        self.prev.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_prev(&self, pfn: Pfn) {
        self.prev.store(pfn, Ordering::Relaxed);
    }
}

/// 页描述符数组 (mem_map)
///
/// 下标即页帧号。由 [`crate::Pmm`] 持有并传引用给各操作，
/// 不再是进程级全局变量。
pub struct MemMap {
    pages: Vec<Page>,
}

impl MemMap {
    /// 按布局上界建立描述符数组，所有页先标记为保留，
    /// 可用区域随后由分配器初始化为空闲。
    pub fn new(nr_pages: usize) -> Self {
        let mut pages = Vec::with_capacity(nr_pages);
        for _ in 0..nr_pages {
            let page = Page::new();
            page.init_reserved();
            pages.push(page);
        }
        Self { pages }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// 获取页描述符
    #[inline]
    pub fn page(&self, pfn: Pfn) -> &Page {
        &self.pages[pfn]
    }

    /// 页帧号是否有效
    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn < self.pages.len()
    }
}

/// 页描述符统计信息
#[derive(Debug, Clone, Copy, Default)]
pub struct PageDescStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
    pub reserved_pages: usize,
    pub dirty_pages: usize,
    pub anonymous_pages: usize,
    pub lru_pages: usize,
}

impl MemMap {
    /// 遍历描述符数组收集统计
    pub fn stats(&self) -> PageDescStats {
        let mut stats = PageDescStats {
            total_pages: self.pages.len(),
            ..Default::default()
        };

        for page in &self.pages {
            if page.refcount() == 0 {
                stats.free_pages += 1;
            } else {
                stats.used_pages += 1;
            }
            if page.is_reserved() {
                stats.reserved_pages += 1;
            }
            if page.is_dirty() {
                stats.dirty_pages += 1;
            }
            if page.is_anonymous() {
                stats.anonymous_pages += 1;
            }
            if page.is_lru() {
                stats.lru_pages += 1;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_flags() {
        let flags = PageFlags::new();

        assert!(!flags.test(PageFlag::Locked));
        assert!(!flags.test(PageFlag::Dirty));

        flags.set(PageFlag::Locked);
        assert!(flags.test(PageFlag::Locked));

        flags.set(PageFlag::Dirty);
        assert!(flags.test(PageFlag::Dirty));

        flags.clear(PageFlag::Locked);
        assert!(!flags.test(PageFlag::Locked));
        assert!(flags.test(PageFlag::Dirty));

        assert!(flags.test_and_clear(PageFlag::Dirty));
        assert!(!flags.test_and_clear(PageFlag::Dirty));
    }

    #[test]
    fn test_page_refcount() {
        let page = Page::new();

        assert_eq!(page.refcount(), 0);
        page.get();
        assert_eq!(page.refcount(), 1);
        page.get();
        assert_eq!(page.refcount(), 2);
        assert_eq!(page.put(), 2);
        assert_eq!(page.put(), 1);
        assert_eq!(page.refcount(), 0);
    }

    #[test]
    #[should_panic(expected = "DoubleFreeDetected")]
    fn test_double_put_panics() {
        let page = Page::new();
        page.get();
        page.put();
        page.put();
    }

    #[test]
    fn test_migrate_fallbacks() {
        // 借用顺序永远不包含自身
        for mt in [
            MigrateType::Unmovable,
            MigrateType::Movable,
            MigrateType::Reclaimable,
        ] {
            for fb in mt.fallbacks() {
                assert_ne!(fb, mt);
            }
        }
    }

    #[test]
    fn test_mem_map() {
        let map = MemMap::new(16);
        assert_eq!(map.len(), 16);
        assert!(map.contains(15));
        assert!(!map.contains(16));
        // 初始全部保留
        assert_eq!(map.stats().reserved_pages, 16);
    }
}
