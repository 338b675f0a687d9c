//! MIT License
//!
//! Copyright (c) 2026 Pmm Developers
//!

//! 运行时可调参数表
//!
//! 文本化的键值配置面（等价于一张 sysctl 表）。数值都是运行
//! 策略而非不变量，默认值来自 Pmm.toml 生成的编译期常量。
//! 带副作用的键（水位派生、OOM 偏置）由 [`crate::Pmm`] 的
//! 包装方法处理。

use alloc::format;
use alloc::string::String;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::config::{DEFAULT_MIN_FREE_RESERVE_KB, DEFAULT_SWAPPINESS, DEFAULT_WATERMARK_SCALE_FACTOR};
use crate::error::SysctlError;

/// 虚拟内存承诺的判定模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OvercommitMode {
    /// 启发式：拒绝明显超过物理内存的单次承诺
    Heuristic = 0,
    /// 总是允许
    AlwaysAllow = 1,
    /// 严格：承诺总量不得超过上限
    Strict = 2,
}

impl OvercommitMode {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => OvercommitMode::AlwaysAllow,
            2 => OvercommitMode::Strict,
            _ => OvercommitMode::Heuristic,
        }
    }
}

/// 可调参数表
pub struct Sysctl {
    /// min 水位对应的保留内存（KB）
    min_free_reserve_kb: AtomicUsize,
    /// 水位比例系数（万分比）
    watermark_scale_factor: AtomicUsize,
    /// 换出倾向 0-200（0 表示不回收匿名页）
    swap_preference: AtomicUsize,
    /// 承诺判定模式
    overcommit_mode: AtomicU32,
    /// Strict 模式上限：物理内存的百分比
    overcommit_ratio: AtomicUsize,
    /// Strict 模式上限：绝对值（KB），非零时优先于 ratio
    overcommit_absolute_kb: AtomicUsize,
}

impl Sysctl {
    pub fn new() -> Self {
        Self {
            min_free_reserve_kb: AtomicUsize::new(DEFAULT_MIN_FREE_RESERVE_KB),
            watermark_scale_factor: AtomicUsize::new(DEFAULT_WATERMARK_SCALE_FACTOR),
            swap_preference: AtomicUsize::new(DEFAULT_SWAPPINESS),
            overcommit_mode: AtomicU32::new(OvercommitMode::Heuristic as u32),
            overcommit_ratio: AtomicUsize::new(50),
            overcommit_absolute_kb: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn min_free_reserve_kb(&self) -> usize {
        self.min_free_reserve_kb.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn watermark_scale_factor(&self) -> usize {
        self.watermark_scale_factor.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn swap_preference(&self) -> usize {
        self.swap_preference.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn overcommit_mode(&self) -> OvercommitMode {
        OvercommitMode::from_u32(self.overcommit_mode.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn overcommit_ratio(&self) -> usize {
        self.overcommit_ratio.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn overcommit_absolute_kb(&self) -> usize {
        self.overcommit_absolute_kb.load(Ordering::Relaxed)
    }

    /// 按键读取，未知键返回 None
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "min_free_reserve_kb" => self.min_free_reserve_kb(),
            "watermark_scale_factor" => self.watermark_scale_factor(),
            "swap_preference" => self.swap_preference(),
            "overcommit_mode" => self.overcommit_mode.load(Ordering::Relaxed) as usize,
            "overcommit_ratio" => self.overcommit_ratio(),
            "overcommit_absolute_kb" => self.overcommit_absolute_kb(),
            _ => return None,
        };
        Some(format!("{}", value))
    }

    /// 按键写入；范围检查失败返回 InvalidValue
    pub fn set(&self, key: &str, value: &str) -> Result<(), SysctlError> {
        let parse = || value.trim().parse::<usize>().map_err(|_| SysctlError::InvalidValue);
        match key {
            "min_free_reserve_kb" => {
                self.min_free_reserve_kb.store(parse()?, Ordering::Relaxed);
            }
            "watermark_scale_factor" => {
                let v = parse()?;
                if v > 1000 {
                    return Err(SysctlError::InvalidValue);
                }
                self.watermark_scale_factor.store(v, Ordering::Relaxed);
            }
            "swap_preference" => {
                let v = parse()?;
                if v > 200 {
                    return Err(SysctlError::InvalidValue);
                }
                self.swap_preference.store(v, Ordering::Relaxed);
            }
            "overcommit_mode" => {
                let v = parse()?;
                if v > 2 {
                    return Err(SysctlError::InvalidValue);
                }
                self.overcommit_mode.store(v as u32, Ordering::Relaxed);
            }
            "overcommit_ratio" => {
                let v = parse()?;
                if v > 100 {
                    return Err(SysctlError::InvalidValue);
                }
                self.overcommit_ratio.store(v, Ordering::Relaxed);
            }
            "overcommit_absolute_kb" => {
                self.overcommit_absolute_kb.store(parse()?, Ordering::Relaxed);
            }
            _ => return Err(SysctlError::UnknownKey),
        }
        Ok(())
    }
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new()
    }
}
