//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!
//! Pmm 引擎配置
//!
//! 编译期常量由 build.rs 根据 Pmm.toml 生成；
//! 运行时可调的策略值见 [`crate::sysctl`]。

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// 迁移类型数量
pub const MIGRATE_TYPES: usize = 3;

/// 每 KB 对应的页数换算：KB 转页数
pub const fn kb_to_pages(kb: usize) -> usize {
    (kb * 1024) / PAGE_SIZE
}
