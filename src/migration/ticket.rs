//! 准考证号生成
//!
//! 格式：`TBAT-{V|F}-{base36 毫秒时间戳}-{4 字节随机 hex}`，整体大写。
//! 构造本身不保证全局唯一：同一运行内用已签发集合做有界重试（3 次），
//! 最终仍以存储层唯一约束兜底（插入冲突按"已迁移，跳过"处理）。

use std::collections::HashSet;

use rand::RngCore;

use crate::error::{OpsError, Result};

/// 同一运行内的有界重试次数
const MAX_GENERATE_ATTEMPTS: u32 = 3;

/// 准考证号生成器
///
/// 持有本次运行已签发的号码集合；跨运行的唯一性由存储层约束保证。
pub struct TicketGenerator {
    issued: HashSet<String>,
}

impl TicketGenerator {
    pub fn new() -> Self {
        Self {
            issued: HashSet::new(),
        }
    }

    /// 为指定层级生成一个本运行内唯一的准考证号
    pub fn generate(&mut self, tier: &str) -> Result<String> {
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let ticket = format_ticket(tier);
            if self.issued.insert(ticket.clone()) {
                return Ok(ticket);
            }
        }
        Err(OpsError::Integrity(format!(
            "Failed to generate a unique exam ticket after {} attempts",
            MAX_GENERATE_ATTEMPTS
        )))
    }

    /// 本次运行已签发数量
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }
}

impl Default for TicketGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn format_ticket(tier: &str) -> String {
    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u128;
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    let tier_code = if tier == "VVIP" { 'V' } else { 'F' };
    format!(
        "TBAT-{}-{}-{}",
        tier_code,
        base36(now_ms),
        hex::encode(random)
    )
    .to_uppercase()
}

/// 无符号整数的 base36 表示（小写，稍后整体大写）
fn base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// 号码格式校验（验证基座与健康检查用）
pub fn is_valid_ticket(ticket: &str) -> bool {
    let parts: Vec<&str> = ticket.split('-').collect();
    if parts.len() != 4 || parts[0] != "TBAT" {
        return false;
    }
    let tier_ok = parts[1] == "V" || parts[1] == "F";
    let body_ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
    };
    tier_ok && body_ok(parts[2]) && body_ok(parts[3])
}
