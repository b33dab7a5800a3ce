use regex::Regex;

use super::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTarget {
    Request,
    Response,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentAction {
    Flag,
    Block,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct ContentRule {
    pub name: String,
    pub target: ContentTarget,
    pub patterns: Vec<Regex>,
    pub severity: Severity,
    pub action: ContentAction,
    pub description: String,
}

impl ContentRule {
    pub fn matches_target(&self, candidate: ContentTarget) -> bool {
        matches!(
            (self.target, candidate),
            (ContentTarget::Both, _) | (ContentTarget::Request, ContentTarget::Request) | (ContentTarget::Response, ContentTarget::Response)
        )
    }
}
