use std::sync::Arc;
use wildmatch::WildMatch;

/// Matcher 抽象接口：按 machine name 过滤 workspace 列表
pub trait Matcher: Send + Sync {
    fn matches(&self, machine_name: &str) -> bool;
    /// 用于前缀预过滤的固定前缀（如果有）
    fn prefix(&self) -> Option<&str> {
        None
    }
}

/// 包含匹配 (contains)
pub struct ExactMatcher {
    pattern: String,
}

impl ExactMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
        }
    }
}

impl Matcher for ExactMatcher {
    fn matches(&self, machine_name: &str) -> bool {
        machine_name.contains(&self.pattern)
    }
}

/// 通配符匹配 (Glob)
pub struct GlobMatcher {
    wild: WildMatch,
    prefix: Option<String>,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Self {
        let prefix = pattern
            .split(['*', '?'])
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        Self {
            wild: WildMatch::new(pattern),
            prefix,
        }
    }
}

impl Matcher for GlobMatcher {
    fn matches(&self, machine_name: &str) -> bool {
        self.wild.matches(machine_name)
    }

    fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

pub fn create_matcher(pattern: &str) -> Arc<dyn Matcher> {
    if pattern.contains('*') || pattern.contains('?') {
        Arc::new(GlobMatcher::new(pattern))
    } else {
        Arc::new(ExactMatcher::new(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_glob_only_for_wildcards() {
        let m = create_matcher("stage");
        assert!(m.matches("pre_stage_2"));
        assert!(m.prefix().is_none());

        let g = create_matcher("stage_?");
        assert_eq!(g.prefix(), Some("stage_"));
        assert!(g.matches("stage_1"));
        assert!(!g.matches("stage_12"));
    }
}
