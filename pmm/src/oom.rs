//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! OOM 选择器
//!
//! 只有在直接回收和规整都反复失败、且请求是阻塞式（非 may-fail）
//! 时才进入。给每个分配域打分并终结得分最高者，把内存强制还给
//! 系统。
//!
//! # 状态机
//! Normal -> ReclaimFailing -> OomTerritory -> VictimChosen
//!        -> Recovering -> Normal
//!
//! # 并发
//! 终结是全局可见的破坏性动作：两个同时跌入 OomTerritory 的
//! 分配上下文绝不能重复选择/重复终结。gate 互斥锁保证单一赢家，
//! 输家等待赢家的结果再重试自己的分配。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use log::warn;
use spin::{Mutex, RwLock};

use crate::config::{OOM_BIAS_MAX, OOM_BIAS_MIN};

/// 分配域标识
pub type DomainId = usize;

/// 无效域标识
pub const DOMAIN_ID_NONE: DomainId = usize::MAX;

/// 分配域（进程或控制组级别的记账单元）
///
/// badness 评分只在 OOM 时刻被查询。
pub struct Domain {
    id: DomainId,
    name: String,
    /// 驻留页数
    resident_pages: AtomicUsize,
    /// 已换出页数
    swap_pages: AtomicUsize,
    /// 管理员可调偏置，钳位在 [OOM_BIAS_MIN, OOM_BIAS_MAX]
    bias: AtomicI32,
    /// 是否存活
    alive: AtomicBool,
    /// 被 OOM 选择器终结过（作为副作用上报给域，不是分配器错误）
    terminated: AtomicBool,
}

impl Domain {
    fn new(id: DomainId, name: String) -> Self {
        Self {
            id,
            name,
            resident_pages: AtomicUsize::new(0),
            swap_pages: AtomicUsize::new(0),
            bias: AtomicI32::new(0),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn resident_pages(&self) -> usize {
        self.resident_pages.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn swap_pages(&self) -> usize {
        self.swap_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_resident(&self, pages: usize) {
        self.resident_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_resident(&self, pages: usize) {
        self.resident_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    pub(crate) fn swap_out_one(&self) {
        self.resident_pages.fetch_sub(1, Ordering::Relaxed);
        self.swap_pages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bias(&self) -> i32 {
        self.bias.load(Ordering::Relaxed)
    }

    /// 设置偏置，自动钳位
    pub fn set_bias(&self, bias: i32) {
        let clamped = bias.clamp(OOM_BIAS_MIN, OOM_BIAS_MAX);
        self.bias.store(clamped, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// 域是否曾被选为牺牲者
    #[inline]
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_terminated(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.terminated.store(true, Ordering::Relaxed);
        self.swap_pages.store(0, Ordering::Relaxed);
    }

    /// badness 评分：驻留 + 换出，按偏置修正
    ///
    /// 偏置以 total_pages/1000 为单位放大（偏置 1000 相当于
    /// 整个系统的内存占用）。
    pub fn badness(&self, total_pages: usize) -> i64 {
        let base = (self.resident_pages() + self.swap_pages()) as i64;
        let adj = self.bias() as i64 * total_pages as i64 / 1000;
        (base + adj).max(0)
    }
}

/// 域注册表
pub struct DomainTable {
    domains: RwLock<Vec<Arc<Domain>>>,
}

impl DomainTable {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(Vec::new()),
        }
    }

    /// 注册一个新域，返回稳定的域标识（注册顺序即标识顺序）
    pub fn register(&self, name: &str) -> Arc<Domain> {
        let mut domains = self.domains.write();
        let id = domains.len();
        let domain = Arc::new(Domain::new(id, String::from(name)));
        domains.push(domain.clone());
        domain
    }

    pub fn get(&self, id: DomainId) -> Option<Arc<Domain>> {
        self.domains.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }

    /// 所有存活域的快照
    pub fn snapshot(&self) -> Vec<Arc<Domain>> {
        self.domains.read().iter().cloned().collect()
    }
}

impl Default for DomainTable {
    fn default() -> Self {
        Self::new()
    }
}

/// OOM 状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OomPhase {
    Normal = 0,
    ReclaimFailing = 1,
    OomTerritory = 2,
    VictimChosen = 3,
    Recovering = 4,
}

impl OomPhase {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => OomPhase::ReclaimFailing,
            2 => OomPhase::OomTerritory,
            3 => OomPhase::VictimChosen,
            4 => OomPhase::Recovering,
            _ => OomPhase::Normal,
        }
    }
}

/// OOM 选择器
pub struct OomKiller {
    phase: AtomicU32,
    /// 单赢家门：串行化进入牺牲者选择
    pub(crate) gate: Mutex<()>,
    /// 赢家正在处理中，输家据此等待
    pub(crate) in_progress: AtomicBool,
    /// 终结次数
    kills: AtomicUsize,
    /// 最近一次的牺牲者
    last_victim: AtomicUsize,
}

impl OomKiller {
    pub fn new() -> Self {
        Self {
            phase: AtomicU32::new(OomPhase::Normal as u32),
            gate: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            kills: AtomicUsize::new(0),
            last_victim: AtomicUsize::new(DOMAIN_ID_NONE),
        }
    }

    #[inline]
    pub fn phase(&self) -> OomPhase {
        OomPhase::from_u32(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn advance(&self, phase: OomPhase) {
        self.phase.store(phase as u32, Ordering::Release);
    }

    #[inline]
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::Relaxed)
    }

    pub fn last_victim(&self) -> Option<DomainId> {
        match self.last_victim.load(Ordering::Relaxed) {
            DOMAIN_ID_NONE => None,
            id => Some(id),
        }
    }

    pub(crate) fn record_kill(&self, victim: DomainId) {
        self.kills.fetch_add(1, Ordering::Relaxed);
        self.last_victim.store(victim, Ordering::Relaxed);
    }

    /// 选择牺牲者：得分最高的可终结域，平分时取最小域标识。
    ///
    /// 偏置处于下限钳位值的域视为不可杀，除非没有任何其他
    /// 可终结域（绝对最后手段）。
    pub fn select_victim(&self, table: &DomainTable, total_pages: usize) -> Option<Arc<Domain>> {
        let domains = table.snapshot();

        let pick = |last_resort: bool| -> Option<Arc<Domain>> {
            let mut best: Option<(&Arc<Domain>, i64)> = None;
            for d in &domains {
                if !d.is_alive() {
                    continue;
                }
                if !last_resort && d.bias() <= OOM_BIAS_MIN {
                    continue;
                }
                let score = d.badness(total_pages);
                // 按注册顺序遍历，只有严格更高分才替换：平分取最小标识
                match best {
                    Some((_, best_score)) if score <= best_score => {}
                    _ => best = Some((d, score)),
                }
            }
            best.map(|(d, _)| d.clone())
        };

        let victim = pick(false).or_else(|| {
            warn!("oom: only min-bias domains remain, last resort selection");
            pick(true)
        });
        victim
    }
}

impl Default for OomKiller {
    fn default() -> Self {
        Self::new()
    }
}
