//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!
//! Pmm - 物理内存分配与回收引擎
//!
//! 一个 no_std 库 crate，实现：
//! - 伙伴系统页块分配器（按迁移类型分链，分裂/合并）
//! - Per-CPU 页缓存（批量换入换出，摊薄区域锁成本）
//! - Slab 对象缓存（每 CPU 游标 + 代数 CAS 快速路径）
//! - 水位驱动的回收管线：后台回收、直接回收、规整、OOM 选择器
//!
//! 所有状态装在显式上下文 [`Pmm`] 中，由启动时的物理内存布局
//! 重建，没有全局变量，也没有持久化。
//!
//! 虚拟地址翻译、页表、文件 I/O、交换设备管理都不在这里：
//! 它们是上层客户，通过 [`PageIo`] 回调和 LRU/收缩器注册
//! 接口与引擎协作。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod list;
pub mod page;
pub mod page_desc;
pub mod zone;
pub mod page_alloc;
pub mod pcp;
pub mod lru;
pub mod slab;
pub mod reclaim;
pub mod compaction;
pub mod oom;
pub mod sysctl;
pub mod meminfo;
mod pmm;

pub use config::{MAX_ORDER, NR_ORDERS, PAGE_SHIFT, PAGE_SIZE};
pub use error::{AllocError, SysctlError};
pub use lru::{LruCategory, LruStats};
pub use meminfo::MemoryInfo;
pub use oom::{Domain, DomainId, DomainTable, OomKiller, OomPhase};
pub use page::{MemRegion, MemoryLayout, PageHandle, Pfn, PhysAddr};
pub use page_alloc::BuddyStats;
pub use page_desc::{MemMap, MigrateType, Page, PageFlag, PageFlags};
pub use pmm::{AllocRequest, GfpFlags, NoIo, NodeData, PageIo, Pmm};
pub use reclaim::Kswapd;
pub use slab::{CacheHandle, CacheStats, ObjRef};
pub use sysctl::{OvercommitMode, Sysctl};
pub use zone::{classify, Watermarks, Zone, ZonePressure, ZoneType};
