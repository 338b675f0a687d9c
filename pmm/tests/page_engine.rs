// 测试：页块分配引擎（伙伴系统 / PCP / slab / 规整 / sysctl）

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use pmm::{
    AllocError, AllocRequest, GfpFlags, MemRegion, MemoryLayout, NoIo, Pmm, Zone, ZoneType,
};

fn engine(nr_pages: usize) -> Pmm {
    Pmm::single_zone(nr_pages, Box::new(NoIo))
}

/// 关掉水位，纯粹测分配语义
fn engine_no_watermarks(nr_pages: usize) -> Pmm {
    let pmm = engine(nr_pages);
    pmm.sysctl_set("min_free_reserve_kb", "0").unwrap();
    pmm.sysctl_set("watermark_scale_factor", "0").unwrap();
    pmm
}

fn normal_zone(pmm: &Pmm) -> &Zone {
    pmm.node(0).unwrap().zone(ZoneType::Normal).unwrap()
}

#[test]
fn test_allocate_free_roundtrip() {
    let pmm = engine_no_watermarks(256);
    let zone = normal_zone(&pmm);

    let h = pmm
        .allocate(AllocRequest::new(3, GfpFlags::KERNEL))
        .unwrap();
    assert_eq!(h.nr_pages(), 8);
    assert_eq!(zone.free_pages(), 248);

    pmm.free(h);
    pmm.drain_all_pcp();
    assert_eq!(zone.free_pages(), 256);
}

#[test]
fn test_buddy_pair_merges_to_higher_order() {
    // 释放两个互为伙伴的 order-2 块（相对地址只差 bit2），
    // 空闲链上应出现一个低地址的 order-3 块，原 order-2 块消失
    let pmm = engine_no_watermarks(64);
    let zone = normal_zone(&pmm);

    let mut blocks = Vec::new();
    loop {
        match pmm.allocate(AllocRequest::new(2, GfpFlags::KERNEL | GfpFlags::MAY_FAIL)) {
            Ok(h) => blocks.push(h),
            Err(_) => break,
        }
    }
    assert_eq!(blocks.len(), 16);
    assert_eq!(zone.free_pages(), 0);

    let a = blocks.iter().copied().find(|h| h.pfn == 8).unwrap();
    let b = blocks.iter().copied().find(|h| h.pfn == 12).unwrap();
    pmm.free(a);
    pmm.free(b);

    let mem = pmm.mem_map();
    assert!(zone.is_free_block(mem, 8, 3));
    assert!(!zone.is_free_block(mem, 8, 2));
    assert!(!zone.is_free_block(mem, 12, 2));
    let stats = zone.buddy_stats();
    assert_eq!(stats.nr_free[2], 0);
    assert_eq!(stats.nr_free[3], 1);
}

#[test]
fn test_conservation_under_mixed_traffic() {
    // 守恒：任意分配/释放序列后的静息点上，
    // 空闲 + 已分配 == 区域总量
    let pmm = engine_no_watermarks(1024);
    let zone = normal_zone(&pmm);
    let total = zone.managed_pages();

    // 简单线性同余伪随机驱动
    let mut state = 0x9e3779b9u64;
    let mut rand = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as usize
    };

    let mut held = Vec::new();
    for _ in 0..2000 {
        if rand() % 3 != 0 || held.is_empty() {
            let order = rand() % 4;
            let req = AllocRequest::new(order, GfpFlags::KERNEL | GfpFlags::MAY_FAIL);
            if let Ok(h) = pmm.allocate(req) {
                held.push(h);
            }
        } else {
            let idx = rand() % held.len();
            pmm.free(held.swap_remove(idx));
        }
    }

    pmm.drain_all_pcp();
    let allocated: usize = held.iter().map(|h| h.nr_pages()).sum();
    assert_eq!(zone.free_pages() + allocated, total);
    assert_eq!(zone.buddy_stats().free_pages, zone.free_pages());

    for h in held {
        pmm.free(h);
    }
    pmm.drain_all_pcp();
    assert_eq!(zone.free_pages(), total);
}

#[test]
#[should_panic(expected = "DoubleFreeDetected")]
fn test_double_free_rejected() {
    let pmm = engine_no_watermarks(64);
    let h = pmm
        .allocate(AllocRequest::new(0, GfpFlags::KERNEL))
        .unwrap();
    pmm.free(h);
    pmm.free(h);
}

#[test]
fn test_pcp_keeps_zone_counter_honest() {
    // PCP 滞留的页从区域视角"在用"：排空后计数还原
    let pmm = engine_no_watermarks(256);
    let zone = normal_zone(&pmm);

    let h = pmm
        .allocate(AllocRequest::new(0, GfpFlags::KERNEL).cpu(2))
        .unwrap();
    pmm.free_on(h, 2);
    assert!(zone.free_pages() < 256);

    pmm.drain_all_pcp();
    assert_eq!(zone.free_pages(), 256);
}

#[test]
fn test_compaction_rescues_fragmented_high_order() {
    // 交替 used/free 的 order-0 碎片占满一半容量时，order-4
    // 在规整前不可满足，规整后可满足
    let pmm = engine_no_watermarks(256);
    let zone = normal_zone(&pmm);

    let mut held = Vec::new();
    loop {
        match pmm.allocate(AllocRequest::new(0, GfpFlags::USER | GfpFlags::MAY_FAIL)) {
            Ok(h) => held.push(h),
            Err(_) => break,
        }
    }
    // 偶数页帧全部释放，形成交替空洞
    for h in &held {
        if h.pfn % 2 == 0 {
            pmm.free(*h);
        }
    }
    pmm.drain_all_pcp();
    assert_eq!(zone.free_pages(), 128);

    // 规整前：总空闲足够但没有 order-4 连续块
    assert!(!zone.has_free_block(4));

    let migrated = pmm.compact_zone(zone);
    assert!(migrated > 0, "movable pages must migrate");

    let h = pmm.allocate(AllocRequest::new(4, GfpFlags::USER | GfpFlags::MAY_FAIL));
    assert!(h.is_ok(), "order-4 must succeed after compaction: {:?}", h);
}

#[test]
fn test_compaction_blocked_by_unmovable() {
    // 在用页全部不可移动时规整无能为力，多页请求确定性失败
    let pmm = engine_no_watermarks(256);
    let zone = normal_zone(&pmm);

    let mut held = Vec::new();
    loop {
        match pmm.allocate(AllocRequest::new(0, GfpFlags::KERNEL | GfpFlags::MAY_FAIL)) {
            Ok(h) => held.push(h),
            Err(_) => break,
        }
    }
    for h in &held {
        if h.pfn % 2 == 0 {
            pmm.free(*h);
        }
    }
    pmm.drain_all_pcp();
    assert_eq!(zone.free_pages(), 128);

    let migrated = pmm.compact_zone(zone);
    assert_eq!(migrated, 0);

    let r = pmm.allocate(AllocRequest::new(4, GfpFlags::KERNEL | GfpFlags::MAY_FAIL));
    assert_eq!(r, Err(AllocError::FragmentationFailure));
}

#[test]
fn test_cache_concurrent_alloc_free() {
    // 4 个并发上下文对 64 字节对象缓存做 10000 次分配/释放：
    // 任何对象都不会被同时发给两个持有者，结束后 partial 数
    // 回到测试前的值（无 slab 泄漏）
    let pmm = Arc::new(engine_no_watermarks(2048));
    let cache = pmm.cache_create(64).unwrap();
    let partial_before = pmm.cache_stats(cache).unwrap().partial_slabs;

    let outstanding = Arc::new(Mutex::new(HashSet::new()));
    let mut threads = Vec::new();
    for cpu in 0..4 {
        let pmm = pmm.clone();
        let outstanding = outstanding.clone();
        threads.push(thread::spawn(move || {
            let mut held = Vec::new();
            for i in 0..2500usize {
                let obj = pmm.cache_alloc(cache, cpu).unwrap();
                {
                    let mut set = outstanding.lock().unwrap();
                    assert!(set.insert(obj), "object {:?} handed out twice", obj);
                }
                held.push(obj);
                if i % 3 == 0 {
                    if let Some(obj) = held.pop() {
                        outstanding.lock().unwrap().remove(&obj);
                        pmm.cache_free(cache, obj);
                    }
                }
            }
            for obj in held {
                outstanding.lock().unwrap().remove(&obj);
                pmm.cache_free(cache, obj);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    assert!(outstanding.lock().unwrap().is_empty());
    let stats = pmm.cache_stats(cache).unwrap();
    assert_eq!(stats.alloc_count, 10_000);
    assert_eq!(stats.free_count, 10_000);

    pmm.cache_shrink(cache);
    let after = pmm.cache_stats(cache).unwrap();
    assert_eq!(after.partial_slabs, partial_before);
    assert_eq!(after.live_slabs, 0);

    // slab 页全部归还后区域计数还原
    pmm.drain_all_pcp();
    assert_eq!(normal_zone(&pmm).free_pages(), 2048);
}

#[test]
fn test_slab_failure_propagates_no_memory() {
    // 伙伴系统耗尽时对象缓存把 NoMemory 透传给调用者
    let pmm = engine_no_watermarks(16);
    let cache = pmm.cache_create(512).unwrap();

    let mut objs = Vec::new();
    let err = loop {
        match pmm.cache_alloc(cache, 0) {
            Ok(obj) => objs.push(obj),
            Err(e) => break e,
        }
    };
    assert_eq!(err, AllocError::OutOfMemory);
}

#[test]
fn test_dma_zone_constraint() {
    let layout = MemoryLayout::new()
        .push(MemRegion {
            start_pfn: 0,
            nr_pages: 64,
            node: 0,
            zone: ZoneType::Dma,
        })
        .push(MemRegion {
            start_pfn: 64,
            nr_pages: 192,
            node: 0,
            zone: ZoneType::Normal,
        });
    let pmm = Pmm::new(&layout, Box::new(NoIo));
    pmm.sysctl_set("min_free_reserve_kb", "0").unwrap();

    // DMA 约束的分配落在低端区域
    let h = pmm
        .allocate(AllocRequest::new(0, GfpFlags::DMA))
        .unwrap();
    assert!(h.pfn < 64);

    // 普通分配优先 Normal
    let h = pmm
        .allocate(AllocRequest::new(0, GfpFlags::KERNEL))
        .unwrap();
    assert!(h.pfn >= 64);
}

#[test]
fn test_sysctl_surface() {
    let pmm = engine(1024);
    let zone = normal_zone(&pmm);

    // 默认派生：256KB 保留 = 64 页 min
    assert_eq!(zone.watermarks.min(), 64);
    assert_eq!(zone.watermarks.low(), 80);
    assert_eq!(zone.watermarks.high(), 96);

    // 调大保留值立即重新派生
    pmm.sysctl_set("min_free_reserve_kb", "512").unwrap();
    assert_eq!(zone.watermarks.min(), 128);
    assert_eq!(pmm.sysctl_get("min_free_reserve_kb").unwrap(), "512");

    // 域偏置键
    let d = pmm.register_domain("web");
    pmm.sysctl_set(&format!("oom_bias.{}", d), "-500").unwrap();
    assert_eq!(pmm.sysctl_get(&format!("oom_bias.{}", d)).unwrap(), "-500");

    assert!(pmm.sysctl_set("bogus", "1").is_err());
}

#[test]
fn test_overcommit_modes() {
    let pmm = engine(1024);

    // 启发式：单笔超过物理内存才拒绝
    assert!(pmm.may_commit(1024));
    assert!(!pmm.may_commit(1025));

    // 严格：承诺总量对上限负责
    pmm.sysctl_set("overcommit_mode", "2").unwrap();
    pmm.sysctl_set("overcommit_ratio", "50").unwrap();
    assert!(pmm.commit(512));
    assert!(!pmm.commit(1));
    pmm.uncommit(512);
    assert_eq!(pmm.committed_pages(), 0);

    // 总是允许
    pmm.sysctl_set("overcommit_mode", "1").unwrap();
    assert!(pmm.may_commit(usize::MAX / 2));
}

#[test]
fn test_meminfo_snapshot() {
    let pmm = engine(1024);
    let h = pmm
        .allocate(AllocRequest::new(0, GfpFlags::KERNEL))
        .unwrap();

    let info = pmm.meminfo();
    assert_eq!(info.mem_total, 1024 * pmm::PAGE_SIZE);
    assert!(info.mem_free < info.mem_total);
    assert!(!info.zones.is_empty());
    // 格式化输出至少包含总量行
    let text = format!("{}", info.format());
    assert!(text.contains("MemTotal"));

    pmm.free(h);
}
