//! 网关输出归一化
//!
//! 计划：JSON 数组 → 单键包装对象（如 `{"plan": [...]}`）→ 纯文本列表（去除项目符号与编号），
//! 结果为空即 PlanningError。
//! 命令：去除代码围栏、接受 `{"command": "..."}`、去掉空行与整行注释，多行合并为单行；
//! 结果为空或命中禁止前缀即 TranslationError。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::core::TerminusError;
use crate::gateway::RawPlan;

const BULLET_PATTERN: &str = r"^\s*(?:[-*•]|\d+[.)])\s+";

/// 编译失败时为 None，此时保留行首符号
fn bullet_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(BULLET_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(error = %e, "bullet pattern failed to compile");
            None
        }
    })
    .as_ref()
}

fn strip_bullet(line: &str) -> String {
    let line = line.trim();
    match bullet_re() {
        Some(re) => re.replace(line, "").trim().to_string(),
        None => line.to_string(),
    }
}

/// 归一化计划；超过 max_steps 的部分被截断
pub fn normalize_plan(raw: RawPlan, max_steps: usize) -> Result<Vec<String>, TerminusError> {
    let steps = match raw {
        RawPlan::Steps(items) => clean(items),
        RawPlan::Json(value) => steps_from_value(&value)
            .ok_or_else(|| TerminusError::Planning(format!("unrecognised plan shape: {value}")))?,
        RawPlan::Text(text) => steps_from_text(&text),
    };

    if steps.is_empty() {
        return Err(TerminusError::Planning("plan contains no steps".to_string()));
    }
    if steps.len() > max_steps {
        tracing::warn!(steps = steps.len(), max_steps, "plan truncated");
        return Ok(steps.into_iter().take(max_steps).collect());
    }
    Ok(steps)
}

fn clean(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 直接序列，或值为序列的单键对象
fn steps_from_value(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(clean(items.iter().map(item_text).collect())),
        Value::Object(map) if map.len() == 1 => match map.values().next() {
            Some(Value::Array(items)) => Some(clean(items.iter().map(item_text).collect())),
            _ => None,
        },
        _ => None,
    }
}

fn item_text(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn steps_from_text(text: &str) -> Vec<String> {
    let body = strip_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
        if let Some(steps) = steps_from_value(&value) {
            return steps;
        }
    }
    body.lines()
        .map(strip_bullet)
        .filter(|line| !line.is_empty())
        .collect()
}

/// 取出 ``` 围栏内的内容；没有围栏时原样返回
fn strip_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let rest = &text[start + 3..];
    // 跳过语言标记（```bash / ```json）
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    match rest.find("```") {
        Some(end) => &rest[..end],
        None => rest,
    }
}

/// 归一化为单行命令
pub fn normalize_command(raw: &str, forbidden_prefixes: &[String]) -> Result<String, TerminusError> {
    let mut body = strip_fence(raw).trim().to_string();

    if body.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&body) {
            if let Some(Value::String(cmd)) = map.get("command") {
                if !cmd.trim().is_empty() {
                    body = cmd.trim().to_string();
                }
            }
        }
    }

    let command = join_lines(&body);
    if command.is_empty() {
        return Err(TerminusError::Translation("empty command".to_string()));
    }

    let lower = command.to_lowercase();
    if let Some(prefix) = forbidden_prefixes
        .iter()
        .find(|p| !p.is_empty() && lower.starts_with(&p.to_lowercase()))
    {
        return Err(TerminusError::Translation(format!(
            "forbidden command prefix '{}': {command}",
            prefix.trim()
        )));
    }
    Ok(command)
}

fn join_lines(body: &str) -> String {
    let mut out = String::new();
    let mut glue_with_space = false;
    for line in body
        .lines()
        .map(|l| l.replace('\r', "").trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
    {
        let (content, continued) = match line.strip_suffix('\\') {
            Some(stripped) => (stripped.trim_end().to_string(), true),
            None => (line, false),
        };
        if content.is_empty() {
            glue_with_space = continued || glue_with_space;
            continue;
        }
        if !out.is_empty() {
            let leads_with_connector = ["&&", "||", "|"].iter().any(|c| content.starts_with(c));
            out.push_str(if glue_with_space || leads_with_connector {
                " "
            } else {
                "; "
            });
        }
        glue_with_space = continued || ends_with_connector(&content);
        out.push_str(&content);
    }
    out
}

fn ends_with_connector(line: &str) -> bool {
    if ["&&", "||", "|", ";", "{", "("].iter().any(|c| line.ends_with(c)) {
        return true;
    }
    matches!(
        line.split_whitespace().last(),
        Some("then" | "do" | "else")
    )
}
