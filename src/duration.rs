//! 解析服务端返回的紧凑时长字符串，例如 `0s100ms`、`3s10ms`、`1m`、`6m0s`。
//!
//! 单位按“最长优先”匹配：`ms` 必须先于 `m` 尝试，否则 `100ms` 会被拆成 `100m` + `s`。

use crate::error::LimiterError;

/// 单位表（最长优先）。
const UNITS: [(&str, u64); 5] = [
    ("ms", 1),
    ("s", 1_000),
    ("m", 60 * 1_000),
    ("h", 60 * 60 * 1_000),
    ("d", 24 * 60 * 60 * 1_000),
];

/// 将 `<数字><单位>` 串联而成的时长解析为毫秒数。
///
/// 空字符串视为 0；数字允许带小数（如 `7.66s`），结果四舍五入到毫秒。
/// 整数分量按 u64 精确累加，只有带小数的分量经过 f64。
pub fn parse_duration_ms(text: &str) -> Result<u64, LimiterError> {
    let s = text.trim();
    let overflow = || LimiterError::malformed_duration(s, "数值溢出");
    let mut rest = s;
    let mut whole_ms: u64 = 0;
    let mut fraction_ms: f64 = 0.0;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(LimiterError::malformed_duration(s, "缺少数值"));
        }
        let digits = &rest[..num_len];
        rest = &rest[num_len..];

        let Some((unit, ratio)) = UNITS.iter().find(|(unit, _)| rest.starts_with(unit)) else {
            if rest.is_empty() {
                return Err(LimiterError::malformed_duration(s, "数值后缺少单位"));
            }
            return Err(LimiterError::malformed_duration(s, "未知单位"));
        };
        rest = &rest[unit.len()..];

        if digits.contains('.') {
            let number: f64 = digits
                .parse()
                .map_err(|_| LimiterError::malformed_duration(s, "数值格式错误"))?;
            fraction_ms += number * (*ratio as f64);
        } else {
            let number: u64 = digits.parse().map_err(|_| overflow())?;
            whole_ms = number
                .checked_mul(*ratio)
                .and_then(|v| v.checked_add(whole_ms))
                .ok_or_else(overflow)?;
        }
    }

    if !fraction_ms.is_finite() || fraction_ms >= u64::MAX as f64 {
        return Err(overflow());
    }
    whole_ms
        .checked_add(fraction_ms.round() as u64)
        .ok_or_else(overflow)
}

/// 将毫秒数格式化为紧凑形式（与 [`parse_duration_ms`] 使用相同单位顺序）。
///
/// 各分量按 `d`、`h`、`m`、`s`、`ms` 降序输出，省略为 0 的分量；0 输出 `0ms`。
pub fn format_duration_ms(ms: u64) -> String {
    if ms == 0 {
        return "0ms".to_string();
    }
    let mut out = String::new();
    let mut left = ms;
    for (unit, ratio) in UNITS.iter().rev() {
        let n = left / ratio;
        if n == 0 {
            continue;
        }
        left %= ratio;
        out.push_str(&n.to_string());
        out.push_str(unit);
    }
    out
}
