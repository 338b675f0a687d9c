//! Pmm 构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Pmm.toml 配置文件
//! 2. 生成配置代码（OUT_DIR/config.rs，由 src/config.rs include）

use std::env;
use std::fs;
use std::path::PathBuf;

/// 读取整数配置项，缺失时使用默认值
fn get_int(config: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

fn main() {
    println!("cargo:rerun-if-changed=../Pmm.toml");

    let config_content = fs::read_to_string("../Pmm.toml").expect("无法读取 Pmm.toml");

    let config: toml::Value = toml::from_str(&config_content).expect("配置文件解析失败");

    let name = config
        .get("general")
        .and_then(|g| g.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("Pmm");

    let version = config
        .get("general")
        .and_then(|g| g.get("version"))
        .and_then(|v| v.as_str())
        .unwrap_or("0.1.0");

    let page_shift = get_int(&config, "mm", "page_shift", 12);
    let max_order = get_int(&config, "mm", "max_order", 10);
    let max_cpus = get_int(&config, "mm", "max_cpus", 4);

    let pcp_high = get_int(&config, "pcp", "high", 64);
    let pcp_batch = get_int(&config, "pcp", "batch", 16);

    let min_free_kb = get_int(&config, "watermark", "min_free_reserve_kb", 256);
    let wm_scale = get_int(&config, "watermark", "scale_factor", 10);

    let direct_retries = get_int(&config, "reclaim", "direct_retries", 4);
    let scan_batch = get_int(&config, "reclaim", "scan_batch", 32);
    let swappiness = get_int(&config, "reclaim", "swappiness", 60);

    let min_partial = get_int(&config, "slab", "min_partial", 2);

    let bias_min = get_int(&config, "oom", "bias_min", -1000);
    let bias_max = get_int(&config, "oom", "bias_max", 1000);

    let generated = format!(
        r#"// Pmm 配置常量（自动生成）
//
// 此文件由 build.rs 根据 Pmm.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 引擎名称
pub const ENGINE_NAME: &str = "{name}";

/// 引擎版本
pub const ENGINE_VERSION: &str = "{version}";

// ============================================================
// 内存配置
// ============================================================

/// 页大小位移
pub const PAGE_SHIFT: usize = {page_shift};

/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// 伙伴系统最大 order
pub const MAX_ORDER: usize = {max_order};

/// order 数量（0..=MAX_ORDER）
pub const NR_ORDERS: usize = MAX_ORDER + 1;

/// 最大 CPU 数量
pub const MAX_CPUS: usize = {max_cpus};

// ============================================================
// Per-CPU 页缓存配置
// ============================================================

/// PCP 高水位：超过时批量归还给伙伴系统
pub const PCP_HIGH: usize = {pcp_high};

/// PCP 批量操作数量
pub const PCP_BATCH: usize = {pcp_batch};

// ============================================================
// 水位配置（默认值，运行时可通过 sysctl 调整）
// ============================================================

/// 默认保留内存（KB）
pub const DEFAULT_MIN_FREE_RESERVE_KB: usize = {min_free_kb};

/// 默认水位比例系数（万分比）
pub const DEFAULT_WATERMARK_SCALE_FACTOR: usize = {wm_scale};

// ============================================================
// 回收配置
// ============================================================

/// 直接回收的最大轮数
pub const DIRECT_RECLAIM_RETRIES: usize = {direct_retries};

/// 每轮回收扫描的页数
pub const RECLAIM_SCAN_BATCH: usize = {scan_batch};

/// 默认换出倾向（0-200）
pub const DEFAULT_SWAPPINESS: usize = {swappiness};

// ============================================================
// Slab 配置
// ============================================================

/// 每个缓存保留的最少 partial slab 数
pub const SLAB_MIN_PARTIAL: usize = {min_partial};

// ============================================================
// OOM 配置
// ============================================================

/// OOM 偏置下限（此值表示"除非别无选择，否则不可杀"）
pub const OOM_BIAS_MIN: i32 = {bias_min};

/// OOM 偏置上限
pub const OOM_BIAS_MAX: i32 = {bias_max};
"#
    );

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    fs::write(out_dir.join("config.rs"), generated).expect("无法写入生成的配置代码");
}
