//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!
//! 内存统计
//!
//! 汇总各子系统的计数快照，提供类似 /proc/meminfo 的视图。
//!
//! # 统计内容
//! - 区域空闲/水位状态
//! - LRU 链表
//! - Per-CPU 页缓存滞留量
//! - Slab 缓存
//! - OOM 历史

use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::pmm::Pmm;
use crate::zone::ZonePressure;

/// 单区域统计
#[derive(Debug, Clone, Copy)]
pub struct ZoneInfo {
    pub node: usize,
    pub free_pages: usize,
    pub managed_pages: usize,
    pub wmark_min: usize,
    pub wmark_low: usize,
    pub wmark_high: usize,
    pub pressure: ZonePressure,
}

/// 内存统计信息（类似 /proc/meminfo）
#[derive(Debug, Clone, Default)]
pub struct MemoryInfo {
    // ========== 物理内存 ==========
    /// 总管理内存（字节）
    pub mem_total: usize,
    /// 空闲内存（字节）
    pub mem_free: usize,
    /// 已使用内存（字节）
    pub mem_used: usize,

    // ========== LRU ==========
    pub active_anon: usize,
    pub inactive_anon: usize,
    pub active_file: usize,
    pub inactive_file: usize,
    pub unevictable: usize,

    // ========== Per-CPU 页缓存 ==========
    /// 各 CPU 滞留页数之和
    pub pcp_pages: usize,

    // ========== Slab ==========
    pub slab_caches: usize,
    pub slab_live_slabs: usize,

    // ========== OOM ==========
    pub oom_kills: usize,

    // ========== 按区域 ==========
    pub zones: Vec<ZoneInfo>,
}

impl MemoryInfo {
    /// 格式化为人类可读字符串
    pub fn format(&self) -> MemoryInfoFormatter<'_> {
        MemoryInfoFormatter { info: self }
    }
}

/// 内存信息格式化器
pub struct MemoryInfoFormatter<'a> {
    info: &'a MemoryInfo,
}

impl<'a> core::fmt::Display for MemoryInfoFormatter<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Memory Info:")?;
        writeln!(f, "  MemTotal:       {:>10} kB", self.info.mem_total / 1024)?;
        writeln!(f, "  MemFree:        {:>10} kB", self.info.mem_free / 1024)?;
        writeln!(f, "  MemUsed:        {:>10} kB", self.info.mem_used / 1024)?;
        writeln!(f)?;
        writeln!(f, "  Active(anon):   {:>10}", self.info.active_anon)?;
        writeln!(f, "  Inactive(anon): {:>10}", self.info.inactive_anon)?;
        writeln!(f, "  Active(file):   {:>10}", self.info.active_file)?;
        writeln!(f, "  Inactive(file): {:>10}", self.info.inactive_file)?;
        writeln!(f, "  Unevictable:    {:>10}", self.info.unevictable)?;
        writeln!(f)?;
        writeln!(f, "  PcpPages:       {:>10}", self.info.pcp_pages)?;
        writeln!(f, "  SlabCaches:     {:>10}", self.info.slab_caches)?;
        writeln!(f, "  SlabSlabs:      {:>10}", self.info.slab_live_slabs)?;
        writeln!(f, "  OomKills:       {:>10}", self.info.oom_kills)?;
        for z in &self.info.zones {
            writeln!(f)?;
            writeln!(
                f,
                "  Node {} free {} / {} pages ({:?})",
                z.node, z.free_pages, z.managed_pages, z.pressure
            )?;
            writeln!(
                f,
                "    min {} low {} high {}",
                z.wmark_min, z.wmark_low, z.wmark_high
            )?;
        }
        Ok(())
    }
}

impl Pmm {
    /// 获取完整的内存统计信息
    pub fn meminfo(&self) -> MemoryInfo {
        let mut info = MemoryInfo::default();

        for zone in self.zones() {
            let managed = zone.managed_pages();
            let free = zone.free_pages();
            info.mem_total += managed * PAGE_SIZE;
            info.mem_free += free * PAGE_SIZE;

            let lru = zone.lru_stats();
            info.active_anon += lru.active_anon;
            info.inactive_anon += lru.inactive_anon;
            info.active_file += lru.active_file;
            info.inactive_file += lru.inactive_file;
            info.unevictable += lru.unevictable;

            info.pcp_pages += zone
                .pcp_stats()
                .iter()
                .map(|s| s.counts.iter().sum::<usize>())
                .sum::<usize>();

            info.zones.push(ZoneInfo {
                node: zone.node(),
                free_pages: free,
                managed_pages: managed,
                wmark_min: zone.watermarks.min(),
                wmark_low: zone.watermarks.low(),
                wmark_high: zone.watermarks.high(),
                pressure: zone.pressure(),
            });
        }
        info.mem_used = info.mem_total.saturating_sub(info.mem_free);

        info.oom_kills = self.oom.kills();

        // Slab 汇总（按句柄逐个取）
        let mut cache_idx = 0;
        while let Some(stats) = self.cache_stats(crate::slab::CacheHandle(cache_idx)) {
            info.slab_caches += 1;
            info.slab_live_slabs += stats.live_slabs;
            cache_idx += 1;
        }

        info
    }
}
