//! 工具意图策略：判断最新用户消息是否需要工具，以及需要强制哪个工具
//!
//! 默认实现是中英文关键词表；策略可替换，关键词本身不是协议的一部分。

use crate::llm::ToolDefinition;

pub trait ToolIntentPolicy: Send + Sync {
    /// 需要强制调用的工具名；None 表示不需要（或无法确定）
    fn expected_tool(&self, user_text: &str, tools: &[ToolDefinition]) -> Option<String>;
}

/// 一条意图规则：命中任一关键词时，按顺序选择第一个可用的首选工具
#[derive(Debug, Clone)]
pub struct IntentRule {
    /// 意图名，首选工具都不存在时用于按名称模糊匹配工具
    pub intent: String,
    pub keywords: Vec<String>,
    pub preferred_tools: Vec<String>,
}

impl IntentRule {
    pub fn new(intent: &str, keywords: &[&str], preferred_tools: &[&str]) -> Self {
        Self {
            intent: intent.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            preferred_tools: preferred_tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn matches(&self, text_lower: &str) -> bool {
        self.keywords.iter().any(|k| contains_keyword(text_lower, k))
    }

    fn pick(&self, tools: &[ToolDefinition]) -> Option<String> {
        self.preferred_tools
            .iter()
            .find(|name| tools.iter().any(|t| &t.name == *name))
            .cloned()
            .or_else(|| {
                tools
                    .iter()
                    .find(|t| t.name.to_lowercase().contains(&self.intent))
                    .map(|t| t.name.clone())
            })
    }
}

/// 英文关键词按词边界匹配（"find" 不命中 "finding"）；中文没有词边界，按子串匹配
fn contains_keyword(text: &str, keyword: &str) -> bool {
    if !keyword.is_ascii() {
        return text.contains(keyword);
    }
    text.match_indices(keyword).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + keyword.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_alphanumeric())
            && !after.is_some_and(|c| c.is_ascii_alphanumeric())
    })
}

#[derive(Debug, Clone)]
pub struct KeywordIntentPolicy {
    rules: Vec<IntentRule>,
}

impl KeywordIntentPolicy {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }
}

impl Default for KeywordIntentPolicy {
    fn default() -> Self {
        Self::new(vec![
            IntentRule::new("detail", &["detail", "详情"], &["get_feed_detail"]),
            IntentRule::new(
                "login",
                &["login", "log in", "sign in", "登录", "登陆", "扫码"],
                &["check_login_status", "get_login_qrcode"],
            ),
            IntentRule::new(
                "publish",
                &["publish", "post ", "发布", "发表", "发帖"],
                &["publish_content", "publish_with_video"],
            ),
            IntentRule::new(
                "search",
                &["search", "query", "find", "look up", "搜索", "查询", "查找", "搜一下", "找一下"],
                &["search_feeds"],
            ),
            IntentRule::new(
                "feed",
                &["recommend", "feed", "homepage", "推荐", "首页"],
                &["list_feeds"],
            ),
        ])
    }
}

impl ToolIntentPolicy for KeywordIntentPolicy {
    fn expected_tool(&self, user_text: &str, tools: &[ToolDefinition]) -> Option<String> {
        if tools.is_empty() {
            return None;
        }
        let lower = user_text.to_lowercase();
        self.rules
            .iter()
            .filter(|r| r.matches(&lower))
            .find_map(|r| r.pick(tools))
    }
}

/// 从不强制工具的策略
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIntentPolicy;

impl ToolIntentPolicy for NoIntentPolicy {
    fn expected_tool(&self, _user_text: &str, _tools: &[ToolDefinition]) -> Option<String> {
        None
    }
}
