//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! 分配器上下文与分配升级梯
//!
//! [`Pmm`] 把区域表、Per-CPU 结构、域注册表、slab 缓存等全部
//! 状态装进一个显式上下文对象，按引用传给每个操作，不存在
//! 进程级全局变量。
//!
//! 分配控制流：
//! 1. 快速路径：Per-CPU 缓存 / 伙伴系统，水位允许即成功
//! 2. 唤醒后台回收
//! 3. 直接回收（有界轮数，调用上下文内联执行，每轮后重试）
//! 4. order > 0 再做一次规整后重试
//! 5. may-fail 请求到此返回错误；阻塞请求进入 OOM 选择器，
//!    牺牲者释放内存后重试

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use log::{debug, warn};
use spin::{Mutex, RwLock};

use crate::config::{kb_to_pages, DIRECT_RECLAIM_RETRIES, MAX_ORDER};
use crate::error::{AllocError, SysctlError};
use crate::lru::LruCategory;
use crate::oom::{Domain, DomainId, DomainTable, OomKiller, OomPhase};
use crate::page::{MemoryLayout, PageHandle, Pfn};
use crate::page_desc::{MemMap, MigrateType, PageFlag, DOMAIN_NONE};
use crate::reclaim::Kswapd;
use crate::slab::{CacheHandle, CacheStats, ObjRef, SlabBacking, SlabCache};
use crate::sysctl::{OvercommitMode, Sysctl};
use crate::zone::{Zone, ZonePressure, ZoneType};

bitflags! {
    /// 分配请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// 可移动页（用户内存，规整时可迁移）
        const MOVABLE = 1 << 0;
        /// 可回收页（slab 等压力下可释放）
        const RECLAIMABLE = 1 << 1;
        /// 只允许 DMA 区域
        const DMA = 1 << 2;
        /// 允许失败：有界本地重试后直接返回错误，不升级到 OOM
        const MAY_FAIL = 1 << 3;
    }
}

impl GfpFlags {
    /// 内核常规分配（不可移动、阻塞）
    pub const KERNEL: GfpFlags = GfpFlags::empty();
    /// 用户页分配（可移动、阻塞）
    pub const USER: GfpFlags = GfpFlags::MOVABLE;

    /// 标志对应的迁移类型
    pub fn migrate_type(&self) -> MigrateType {
        if self.contains(GfpFlags::MOVABLE) {
            MigrateType::Movable
        } else if self.contains(GfpFlags::RECLAIMABLE) {
            MigrateType::Reclaimable
        } else {
            MigrateType::Unmovable
        }
    }
}

/// 分配请求描述
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// 块大小：2^order 页
    pub order: usize,
    /// 请求标志
    pub gfp: GfpFlags,
    /// 记账归属的分配域
    pub domain: DomainId,
    /// 发起请求的处理器号（Per-CPU 快速路径用）
    pub cpu: usize,
    /// 首选节点
    pub node: usize,
}

impl AllocRequest {
    pub fn new(order: usize, gfp: GfpFlags) -> Self {
        Self {
            order,
            gfp,
            domain: 0,
            cpu: 0,
            node: 0,
        }
    }

    pub fn domain(mut self, domain: DomainId) -> Self {
        self.domain = domain;
        self
    }

    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self
    }
}

/// 外部协作者：回写、换出与迁移的接缝
///
/// 回收引擎不实现文件 I/O 和交换设备管理，只通过这组回调
/// 请求动作；回写完成由协作者调用 [`Pmm::end_writeback`] 上报。
pub trait PageIo: Send + Sync {
    /// 对脏文件页发起回写，true 表示已接受
    fn writeback(&self, pfn: Pfn) -> bool;
    /// 把匿名页换出，true 表示内容已落盘、页可立即释放
    fn swap_out(&self, pfn: Pfn) -> bool;
    /// 规整迁移：把 old 页的内容搬到 new 页，false 表示无法迁移
    fn relocate(&self, old: Pfn, new: Pfn) -> bool;
}

/// 默认协作者：没有后备存储，也没有交换空间
pub struct NoIo;

impl PageIo for NoIo {
    fn writeback(&self, _pfn: Pfn) -> bool {
        false
    }

    fn swap_out(&self, _pfn: Pfn) -> bool {
        false
    }

    fn relocate(&self, _old: Pfn, _new: Pfn) -> bool {
        true
    }
}

/// 压力下收缩自有缓存的回调（文件系统元数据缓存等）
pub(crate) struct Shrinker {
    pub priority: usize,
    pub callback: Box<dyn Fn(usize) -> usize + Send + Sync>,
}

/// 内存节点：区域集合加一个后台回收工作者
pub struct NodeData {
    id: usize,
    pub(crate) zones: Vec<Zone>,
    /// 后台回收工作者（常驻，一节点一个）
    pub kswapd: Kswapd,
}

impl NodeData {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, ztype: ZoneType) -> Option<&Zone> {
        self.zones.iter().find(|z| z.zone_type() == ztype)
    }
}

/// 物理内存分配与回收引擎的上下文
pub struct Pmm {
    pub(crate) mem: MemMap,
    nodes: Vec<NodeData>,
    pub(crate) domains: DomainTable,
    pub(crate) oom: OomKiller,
    sysctl: Sysctl,
    caches: RwLock<Vec<Arc<SlabCache>>>,
    pub(crate) shrinkers: Mutex<Vec<Shrinker>>,
    pub(crate) io: Box<dyn PageIo>,
    /// 虚拟承诺总量（页）
    committed_pages: AtomicUsize,
    /// 所有区域 managed 页数之和
    total_managed: AtomicUsize,
}

impl Pmm {
    /// 从启动物理内存布局重建全部状态
    pub fn new(layout: &MemoryLayout, io: Box<dyn PageIo>) -> Self {
        let mem = MemMap::new(layout.max_pfn());

        // 按 (节点, 区域类型) 聚合区域跨度
        let max_node = layout.regions.iter().map(|r| r.node).max().unwrap_or(0);
        let mut nodes = Vec::with_capacity(max_node + 1);
        for nid in 0..=max_node {
            let mut zones = Vec::new();
            for ztype in [ZoneType::Dma, ZoneType::Normal] {
                let spans: Vec<_> = layout
                    .regions
                    .iter()
                    .filter(|r| r.node == nid && r.zone == ztype && r.nr_pages > 0)
                    .collect();
                if spans.is_empty() {
                    continue;
                }
                let start = spans.iter().map(|r| r.start_pfn).min().unwrap_or(0);
                let end = spans
                    .iter()
                    .map(|r| r.start_pfn + r.nr_pages)
                    .max()
                    .unwrap_or(0);
                let zone = Zone::new(nid, ztype, start, end - start);
                for region in spans {
                    zone.init_free_region(&mem, region.start_pfn, region.nr_pages);
                }
                zones.push(zone);
            }
            nodes.push(NodeData {
                id: nid,
                zones,
                kswapd: Kswapd::new(nid),
            });
        }

        let total_managed: usize = nodes
            .iter()
            .flat_map(|n| n.zones.iter())
            .map(|z| z.managed_pages())
            .sum();

        let pmm = Self {
            mem,
            nodes,
            domains: DomainTable::new(),
            oom: OomKiller::new(),
            sysctl: Sysctl::new(),
            caches: RwLock::new(Vec::new()),
            shrinkers: Mutex::new(Vec::new()),
            io,
            committed_pages: AtomicUsize::new(0),
            total_managed: AtomicUsize::new(total_managed),
        };

        // 域 0 固定是内核域：最低偏置，OOM 最后手段之外不可杀
        let kernel = pmm.domains.register("kernel");
        kernel.set_bias(crate::config::OOM_BIAS_MIN);

        pmm.recompute_watermarks();
        pmm
    }

    /// 单区域便捷构造（测试与嵌入方常用）
    pub fn single_zone(nr_pages: usize, io: Box<dyn PageIo>) -> Self {
        Self::new(&MemoryLayout::single_zone(nr_pages), io)
    }

    #[inline]
    pub(crate) fn mem(&self) -> &MemMap {
        &self.mem
    }

    /// 页描述符数组的只读视图
    pub fn mem_map(&self) -> &MemMap {
        &self.mem
    }

    pub fn nodes(&self) -> &[NodeData] {
        &self.nodes
    }

    pub fn node(&self, nid: usize) -> Option<&NodeData> {
        self.nodes.get(nid)
    }

    /// 所有区域的迭代器
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.nodes.iter().flat_map(|n| n.zones.iter())
    }

    #[inline]
    pub fn total_managed_pages(&self) -> usize {
        self.total_managed.load(Ordering::Relaxed)
    }

    pub fn total_free_pages(&self) -> usize {
        self.zones().map(|z| z.free_pages()).sum()
    }

    /// 页帧所属的区域
    pub(crate) fn zone_of(&self, pfn: Pfn) -> Option<&Zone> {
        self.zones().find(|z| z.contains(pfn))
    }

    /// 按请求约束排出候选区域（Normal 优先，DMA 兜底）
    fn zonelist(&self, gfp: GfpFlags, node: usize) -> Vec<&Zone> {
        let mut list = Vec::new();
        let nr = self.nodes.len();
        for off in 0..nr {
            let n = &self.nodes[(node + off) % nr];
            if gfp.contains(GfpFlags::DMA) {
                if let Some(z) = n.zone(ZoneType::Dma) {
                    list.push(z);
                }
            } else {
                if let Some(z) = n.zone(ZoneType::Normal) {
                    list.push(z);
                }
                if let Some(z) = n.zone(ZoneType::Dma) {
                    list.push(z);
                }
            }
        }
        list
    }

    // ========== 分配 / 释放 ==========

    /// 分配一个 2^order 页的连续块
    pub fn allocate(&self, req: AllocRequest) -> Result<PageHandle, AllocError> {
        if req.order > MAX_ORDER {
            return Err(AllocError::OutOfMemory);
        }
        let mt = req.gfp.migrate_type();
        let zones = self.zonelist(req.gfp, req.node);
        if zones.is_empty() {
            return Err(AllocError::OutOfMemory);
        }
        let may_fail = req.gfp.contains(GfpFlags::MAY_FAIL);

        // 快速路径：不动用 min 以下的保留
        if let Some(h) = self.alloc_from_zonelist(&zones, &req, mt, WatermarkFloor::Min) {
            return Ok(h);
        }

        debug!(
            "allocate: order {} mt {:?} entering slow path",
            req.order, mt
        );
        self.wake_kswapd(&zones);

        loop {
            // 直接回收：有界轮数，内联执行，每轮后重试
            let mut progressed = false;
            for round in 0..DIRECT_RECLAIM_RETRIES {
                let reclaimed = self.direct_reclaim(&zones, req.order);
                if let Some(h) = self.alloc_from_zonelist(&zones, &req, mt, WatermarkFloor::Half) {
                    return Ok(h);
                }
                progressed |= reclaimed > 0;
                if reclaimed == 0 && round > 0 {
                    break;
                }
            }

            // 规整只对多页请求有意义
            if req.order > 0 {
                for zone in &zones {
                    self.compact_zone(zone);
                }
                // 规整后恰好重试一次
                if let Some(h) = self.alloc_from_zonelist(&zones, &req, mt, WatermarkFloor::Half) {
                    return Ok(h);
                }
            }

            if may_fail {
                // 总空闲足够但不连续时单独上报，调用者可降 order 重试
                let fragmented = req.order > 0
                    && zones
                        .iter()
                        .any(|z| z.free_pages() >= (1usize << req.order));
                return Err(if fragmented {
                    AllocError::FragmentationFailure
                } else {
                    AllocError::OutOfMemory
                });
            }

            if progressed {
                // 回收仍有进展，继续下一轮回收而不是升级
                continue;
            }

            // 最后手段：终结一个分配域
            if !self.out_of_memory() {
                // 所有域都受保护：对该调用上下文等同致命
                return Err(AllocError::OutOfMemory);
            }
        }
    }

    /// 释放一个已分配块（Per-CPU 路径走 0 号槽位）
    pub fn free(&self, handle: PageHandle) {
        self.free_on(handle, 0);
    }

    /// 在指定处理器上释放一个已分配块
    ///
    /// 引用计数已为零的句柄会触发 DoubleFreeDetected panic。
    pub fn free_on(&self, handle: PageHandle, cpu: usize) {
        let zone = match self.zone_of(handle.pfn) {
            Some(zone) => zone,
            None => panic!("free: pfn {} outside every zone", handle.pfn),
        };
        let page = self.mem.page(handle.pfn);

        // 重复释放先于其他校验检测（put 对 0 计数 panic）
        if page.put() != 1 {
            // 还有别的引用持有者，所有权未归还
            return;
        }

        if page.private() != handle.order {
            panic!(
                "free: order mismatch, handle {} vs page {}",
                handle.order,
                page.private()
            );
        }

        if page.is_lru() {
            zone.lru_remove(&self.mem, handle.pfn);
        }

        self.account_unalloc(page.domain(), handle.nr_pages());
        let mt = page.migrate_type();
        page.set_domain(DOMAIN_NONE);
        page.flags().clear_all();

        if handle.order == 0 {
            zone.free_pcp(&self.mem, cpu, handle.pfn, mt);
        } else {
            zone.free_one_page(&self.mem, handle.pfn, handle.order, mt);
        }
    }

    /// 从候选区域表里试一轮分配
    fn alloc_from_zonelist(
        &self,
        zones: &[&Zone],
        req: &AllocRequest,
        mt: MigrateType,
        floor: WatermarkFloor,
    ) -> Option<PageHandle> {
        let size = 1usize << req.order;
        for zone in zones {
            let reserve = match floor {
                WatermarkFloor::Min => zone.watermarks.min(),
                WatermarkFloor::Half => zone.watermarks.min() / 2,
            };
            // 水位检查读区域计数；检查和动作之间允许竞争，
            // 靠重试收敛。Per-CPU 缓存里滞留的页早已计为取走，
            // 取它们不受水位约束，只有重填才受
            let watermark_ok = zone.free_pages() >= size + reserve;
            let got = if req.order == 0 {
                zone.pop_pcp_cached(&self.mem, req.cpu, mt).or_else(|| {
                    if watermark_ok {
                        zone.alloc_pcp(&self.mem, req.cpu, mt)
                    } else {
                        None
                    }
                })
            } else if watermark_ok {
                zone.rmqueue(&self.mem, req.order, mt).ok()
            } else {
                None
            };

            if let Some(pfn) = got {
                self.finish_alloc(zone, pfn, req, mt);
                return Some(PageHandle::new(pfn, req.order));
            }
        }
        None
    }

    /// 分配成功后的页描述符与记账处理
    fn finish_alloc(&self, zone: &Zone, pfn: Pfn, req: &AllocRequest, mt: MigrateType) {
        let page = self.mem.page(pfn);
        page.set_refcount(1);
        page.set_private(req.order);
        page.set_migrate_type(mt);
        page.set_domain(req.domain);

        if let Some(domain) = self.domains.get(req.domain) {
            domain.add_resident(1 << req.order);
        }

        // 分配把区域推入回收水位时唤醒后台工作者；
        // 唤醒是一次性的（工作者清醒期间不再重复计数）
        if zone.pressure() >= ZonePressure::BackgroundReclaim {
            if let Some(node) = self.node(zone.node()) {
                node.kswapd.wake();
            }
        }

        // OOM 恢复期且水位回到健康：回到 Normal
        if self.oom.phase() == OomPhase::Recovering && zone.pressure() == ZonePressure::Healthy {
            self.oom.advance(OomPhase::Normal);
        }
    }

    fn account_unalloc(&self, domain: DomainId, pages: usize) {
        if domain != DOMAIN_NONE {
            if let Some(d) = self.domains.get(domain) {
                d.sub_resident(pages);
            }
        }
    }

    /// 唤醒候选区域所属节点的后台回收
    fn wake_kswapd(&self, zones: &[&Zone]) {
        for zone in zones {
            if zone.pressure() >= ZonePressure::BackgroundReclaim {
                if let Some(node) = self.node(zone.node()) {
                    node.kswapd.wake();
                }
            }
        }
    }

    /// 清空所有区域的 Per-CPU 缓存（静息点用）
    pub fn drain_all_pcp(&self) {
        for zone in self.zones() {
            zone.drain_pcp(&self.mem);
        }
    }

    // ========== OOM 升级 ==========

    /// 终结一个分配域并释放其内存
    ///
    /// 单赢家门串行化：同时跌入 OomTerritory 的上下文里只有
    /// 一个执行选择，其余等待其结果后重试自己的分配。
    /// 返回 false 表示没有可终结的域。
    pub(crate) fn out_of_memory(&self) -> bool {
        self.oom.advance(OomPhase::OomTerritory);

        match self.oom.gate.try_lock() {
            Some(_guard) => {
                self.oom.in_progress.store(true, Ordering::Release);
                let outcome = self.oom_kill();
                self.oom.in_progress.store(false, Ordering::Release);
                outcome
            }
            None => {
                // 输家：等赢家出结果
                while self.oom.in_progress.load(Ordering::Acquire) {
                    core::hint::spin_loop();
                }
                true
            }
        }
    }

    fn oom_kill(&self) -> bool {
        let victim = match self
            .oom
            .select_victim(&self.domains, self.total_managed_pages())
        {
            Some(victim) => victim,
            None => {
                warn!("oom: no eligible victim, all domains protected");
                return false;
            }
        };

        self.oom.advance(OomPhase::VictimChosen);
        warn!(
            "oom: terminating domain {} ({}), badness {}",
            victim.id(),
            victim.name(),
            victim.badness(self.total_managed_pages())
        );

        victim.mark_terminated();
        let released = self.release_domain_pages(&victim);
        self.oom.record_kill(victim.id());
        self.oom.advance(OomPhase::Recovering);
        debug!("oom: released {} pages from victim", released);
        true
    }

    /// 把牺牲域持有的所有页强制归还区域
    fn release_domain_pages(&self, victim: &Arc<Domain>) -> usize {
        let mut released = 0;
        for pfn in 0..self.mem.len() {
            let page = self.mem.page(pfn);
            if page.domain() != victim.id() || page.refcount() <= 0 {
                continue;
            }
            if page.test_flag(PageFlag::Reserved) || page.test_flag(PageFlag::Slab) {
                continue;
            }
            let order = page.private();
            let zone = match self.zone_of(pfn) {
                Some(zone) => zone,
                None => continue,
            };
            // 只处理块首页（private 存着分配时的 order，
            // 块内其余页的 domain 不会被设置）
            if page.is_lru() {
                zone.lru_remove(&self.mem, pfn);
            }
            page.set_refcount(0);
            page.set_domain(DOMAIN_NONE);
            let mt = page.migrate_type();
            page.flags().clear_all();
            zone.free_one_page(&self.mem, pfn, order, mt);
            released += 1 << order;
        }
        victim.sub_resident(released.min(victim.resident_pages()));
        released
    }

    // ========== 对象缓存表面 ==========

    /// 创建一个定长对象缓存
    pub fn cache_create(&self, object_size: usize) -> Result<CacheHandle, AllocError> {
        let cache = Arc::new(SlabCache::new(object_size)?);
        let mut caches = self.caches.write();
        caches.push(cache);
        Ok(CacheHandle(caches.len() - 1))
    }

    fn cache(&self, handle: CacheHandle) -> Option<Arc<SlabCache>> {
        self.caches.read().get(handle.0).cloned()
    }

    /// 从对象缓存分配一个对象
    pub fn cache_alloc(&self, handle: CacheHandle, cpu: usize) -> Result<ObjRef, AllocError> {
        let cache = self.cache(handle).ok_or(AllocError::OutOfMemory)?;
        cache.alloc(self, cpu)
    }

    /// 释放一个对象
    pub fn cache_free(&self, handle: CacheHandle, obj: ObjRef) {
        if let Some(cache) = self.cache(handle) {
            cache.free(self, obj);
        }
    }

    /// 收缩缓存，释放所有全空 slab
    pub fn cache_shrink(&self, handle: CacheHandle) {
        if let Some(cache) = self.cache(handle) {
            cache.shrink(self);
        }
    }

    pub fn cache_stats(&self, handle: CacheHandle) -> Option<CacheStats> {
        self.cache(handle).map(|c| c.stats())
    }

    // ========== LRU 注册表面 ==========

    /// 把一个已分配页注册到 LRU（客户声明其可回收）
    ///
    /// 注册后引擎随时可能驱逐并回收该页；仍要主动释放的客户
    /// 必须先 [`Pmm::lru_del`] 取消注册。
    pub fn lru_add(&self, handle: PageHandle, category: LruCategory) {
        if let Some(zone) = self.zone_of(handle.pfn) {
            zone.lru_add(&self.mem, handle.pfn, category);
        }
    }

    /// 把页从 LRU 摘下（客户收回回收许可）
    pub fn lru_del(&self, handle: PageHandle) {
        if let Some(zone) = self.zone_of(handle.pfn) {
            zone.lru_remove(&self.mem, handle.pfn);
        }
    }

    /// 标记页被访问（回收时获得二次机会）
    pub fn mark_referenced(&self, handle: PageHandle) {
        self.mem.page(handle.pfn).set_flag(PageFlag::Referenced);
    }

    /// 标记页为脏（回收前需要回写）
    pub fn mark_dirty(&self, handle: PageHandle) {
        self.mem.page(handle.pfn).set_flag(PageFlag::Dirty);
    }

    /// 锁定页，禁止回收与迁移
    pub fn lock_page(&self, handle: PageHandle) {
        self.mem.page(handle.pfn).set_flag(PageFlag::Locked);
    }

    pub fn unlock_page(&self, handle: PageHandle) {
        self.mem.page(handle.pfn).clear_flag(PageFlag::Locked);
    }

    /// 协作者上报回写完成：页转干净，下一轮扫描可释放
    pub fn end_writeback(&self, pfn: Pfn) {
        let page = self.mem.page(pfn);
        page.clear_flag(PageFlag::Dirty);
        page.clear_flag(PageFlag::Writeback);
    }

    /// 注册压力收缩回调；priority 小者先被调用
    pub fn register_shrinkable(
        &self,
        priority: usize,
        callback: Box<dyn Fn(usize) -> usize + Send + Sync>,
    ) {
        let mut shrinkers = self.shrinkers.lock();
        shrinkers.push(Shrinker { priority, callback });
        shrinkers.sort_by_key(|s| s.priority);
    }

    // ========== 域表面 ==========

    /// 注册一个分配域，返回稳定标识
    pub fn register_domain(&self, name: &str) -> DomainId {
        self.domains.register(name).id()
    }

    pub fn domain(&self, id: DomainId) -> Option<Arc<Domain>> {
        self.domains.get(id)
    }

    /// OOM 选择器状态（阶段、终结次数、最近牺牲者）
    pub fn oom(&self) -> &OomKiller {
        &self.oom
    }

    // ========== sysctl 表面 ==========

    pub fn sysctl_get(&self, key: &str) -> Option<String> {
        if let Some(rest) = key.strip_prefix("oom_bias.") {
            let id: DomainId = rest.parse().ok()?;
            return self
                .domains
                .get(id)
                .map(|d| alloc::format!("{}", d.bias()));
        }
        self.sysctl.get(key)
    }

    pub fn sysctl_set(&self, key: &str, value: &str) -> Result<(), SysctlError> {
        if let Some(rest) = key.strip_prefix("oom_bias.") {
            let id: DomainId = rest.parse().map_err(|_| SysctlError::UnknownKey)?;
            let bias: i32 = value.trim().parse().map_err(|_| SysctlError::InvalidValue)?;
            return match self.domains.get(id) {
                Some(d) => {
                    d.set_bias(bias);
                    Ok(())
                }
                None => Err(SysctlError::UnknownKey),
            };
        }

        self.sysctl.set(key, value)?;
        if key == "min_free_reserve_kb" || key == "watermark_scale_factor" {
            self.recompute_watermarks();
        }
        Ok(())
    }

    pub(crate) fn sysctl(&self) -> &Sysctl {
        &self.sysctl
    }

    /// 从两个可调项派生每个区域的 {min, low, high}
    ///
    /// 保留量按区域大小比例分摊；low/high 与 min 的间距取
    /// min 的固定比例和 scale 增量中的较大者。
    pub(crate) fn recompute_watermarks(&self) {
        let reserve = kb_to_pages(self.sysctl.min_free_reserve_kb());
        let scale = self.sysctl.watermark_scale_factor();
        let total = self.total_managed_pages().max(1);

        for zone in self.zones() {
            let managed = zone.managed_pages();
            if managed == 0 {
                continue;
            }
            let min = (reserve * managed / total).min(managed / 4);
            let incr = managed * scale / 10_000;
            let low = min + (min / 4).max(incr);
            let high = min + (min / 2).max(incr * 2);
            zone.watermarks.set(min, low, high);
        }
    }

    // ========== 虚拟承诺（overcommit） ==========

    /// 当前承诺上限（页），None 表示不设限
    fn commit_limit(&self) -> Option<usize> {
        match self.sysctl.overcommit_mode() {
            OvercommitMode::AlwaysAllow => None,
            OvercommitMode::Heuristic => None,
            OvercommitMode::Strict => {
                let abs = self.sysctl.overcommit_absolute_kb();
                Some(if abs > 0 {
                    kb_to_pages(abs)
                } else {
                    self.total_managed_pages() * self.sysctl.overcommit_ratio() / 100
                })
            }
        }
    }

    /// 判定一笔虚拟承诺是否可接受
    pub fn may_commit(&self, pages: usize) -> bool {
        match self.sysctl.overcommit_mode() {
            OvercommitMode::AlwaysAllow => true,
            // 启发式：单笔不超过全部物理内存即可
            OvercommitMode::Heuristic => pages <= self.total_managed_pages(),
            OvercommitMode::Strict => match self.commit_limit() {
                Some(limit) => self.committed_pages.load(Ordering::Relaxed) + pages <= limit,
                None => true,
            },
        }
    }

    /// 登记一笔承诺；Strict 模式下超限返回 false 且不登记
    pub fn commit(&self, pages: usize) -> bool {
        if !self.may_commit(pages) {
            return false;
        }
        self.committed_pages.fetch_add(pages, Ordering::Relaxed);
        true
    }

    /// 撤销一笔承诺
    pub fn uncommit(&self, pages: usize) {
        let mut cur = self.committed_pages.load(Ordering::Relaxed);
        loop {
            let new = cur.saturating_sub(pages);
            match self.committed_pages.compare_exchange_weak(
                cur,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn committed_pages(&self) -> usize {
        self.committed_pages.load(Ordering::Relaxed)
    }
}

/// 分配路径的水位底线
#[derive(Debug, Clone, Copy)]
enum WatermarkFloor {
    /// 快速路径：不碰 min 以下的保留
    Min,
    /// 回收后的重试：允许用到一半保留，剩下的留给系统自救
    Half,
}

impl SlabBacking for Pmm {
    fn grab_pages(&self, order: usize) -> Result<Pfn, AllocError> {
        let req = AllocRequest::new(order, GfpFlags::RECLAIMABLE | GfpFlags::MAY_FAIL);
        let handle = self.allocate(req)?;
        let page = self.mem.page(handle.pfn);
        page.set_flag(PageFlag::Slab);
        Ok(handle.pfn)
    }

    fn return_pages(&self, pfn: Pfn, order: usize) {
        let page = self.mem.page(pfn);
        page.clear_flag(PageFlag::Slab);
        self.free(PageHandle::new(pfn, order));
    }
}
