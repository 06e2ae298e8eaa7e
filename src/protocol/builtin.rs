//! Built-in protocol checkers.
//!
//! - [`PatternRules`]: regex rules applied line-by-line to produced content
//! - [`IndexedReferences`]: a file index of the checkout plus relative import resolution
//! - [`EvidenceTruth`]: claimed artifacts must exist in the checkout

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, PoisonError, RwLock};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{
    CheckContext, ProtocolKind, ReferenceChecker, ReferenceReport, RulesChecker, RulesVerdict,
    Severity, TruthChecker, TruthVerdict, UnresolvedReference, Violation,
};

static RELATIVE_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bfrom\s+|\brequire\(\s*|\bimport\s+)['"](\.{1,2}/[^'"]+)['"]"#)
        .expect("valid import regex")
});

/// Directories never indexed or treated as project content.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".worktrees", "dist"];

/// Extensions tried when an import omits one.
const RESOLVE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "rs", "py"];

/// A configured rule: a regex and the severity of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    pub severity: Severity,
    pub message: String,
}

impl RuleSpec {
    pub fn new(id: &str, pattern: &str, severity: Severity, message: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            severity,
            message: message.to_string(),
        }
    }
}

pub fn default_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec::new(
            "no-todo",
            r"\b(TODO|FIXME|XXX)\b",
            Severity::Warning,
            "Unfinished work marker left in code",
        ),
        RuleSpec::new(
            "no-placeholder",
            r"\b(unimplemented!|todo!)|(?i:\bplaceholder implementation\b)|(?i:\bnot implemented yet\b)",
            Severity::Error,
            "Placeholder implementation",
        ),
        RuleSpec::new(
            "no-hardcoded-secret",
            r#"(?i)\b(api[_-]?key|secret|password|token)\s*[:=]\s*['"][A-Za-z0-9_\-]{16,}['"]"#,
            Severity::Critical,
            "Hardcoded credential",
        ),
    ]
}

struct CompiledRule {
    spec: RuleSpec,
    regex: Regex,
}

/// Regex rule set. Rules must be loaded before checks run.
pub struct PatternRules {
    specs: Vec<RuleSpec>,
    compiled: RwLock<Option<Vec<CompiledRule>>>,
}

impl PatternRules {
    pub fn new(specs: Vec<RuleSpec>) -> Self {
        Self {
            specs,
            compiled: RwLock::new(None),
        }
    }
}

impl Default for PatternRules {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

#[async_trait]
impl RulesChecker for PatternRules {
    async fn load_rules(&self, _ctx: &CheckContext) -> Result<usize> {
        let mut compiled = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let regex = Regex::new(&spec.pattern)
                .with_context(|| format!("invalid pattern for rule '{}'", spec.id))?;
            compiled.push(CompiledRule {
                spec: spec.clone(),
                regex,
            });
        }
        let count = compiled.len();
        *self.compiled.write().unwrap_or_else(PoisonError::into_inner) = Some(compiled);
        Ok(count)
    }

    async fn check(&self, action: &str, _ctx: &CheckContext) -> Result<RulesVerdict> {
        let guard = self.compiled.read().unwrap_or_else(PoisonError::into_inner);
        let Some(rules) = guard.as_ref() else {
            bail!("rules checked before they were loaded");
        };

        let violations: Vec<Violation> = rules
            .iter()
            .filter_map(|rule| {
                let m = rule.regex.find(action)?;
                let line = action[..m.start()].matches('\n').count() + 1;
                Some(Violation::new(
                    ProtocolKind::Rules,
                    rule.spec.id.clone(),
                    rule.spec.severity,
                    format!("{} (line {})", rule.spec.message, line),
                ))
            })
            .collect();

        Ok(RulesVerdict {
            passed: violations.iter().all(|v| !v.severity.is_blocking()),
            violations,
        })
    }
}

/// Resolves relative imports against an index of the project's files.
///
/// One index per execution, built once by `build_index` and only read
/// afterwards. Paths are stored relative to the indexed root with `/`
/// separators. Files the task created in its own checkout resolve too.
#[derive(Default)]
pub struct IndexedReferences {
    indexes: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl IndexedReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexed(&self, execution_id: &str) -> usize {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .map_or(0, BTreeSet::len)
    }

    fn resolves(&self, candidate: &str, ctx: &CheckContext) -> bool {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let index = indexes.get(&ctx.execution_id);
        candidates(candidate).iter().any(|c| {
            index.is_some_and(|index| index.contains(c)) || ctx.root.join(c).is_file()
        })
    }

    fn suggestions(&self, reference: &str, execution_id: &str) -> Vec<String> {
        let Some(stem) = file_stem(reference) else {
            return Vec::new();
        };
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = indexes.get(execution_id) else {
            return Vec::new();
        };
        index
            .iter()
            .filter(|path| file_stem(path).is_some_and(|s| s == stem))
            .take(3)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReferenceChecker for IndexedReferences {
    async fn build_index(&self, ctx: &CheckContext) -> Result<usize> {
        let root = ctx.root.clone();
        let files = tokio::task::spawn_blocking(move || index_files(&root))
            .await
            .context("reference indexing task failed")??;
        let count = files.len();
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.execution_id.clone(), files);
        Ok(count)
    }

    fn forget(&self, execution_id: &str) {
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
    }

    async fn check(
        &self,
        code: &str,
        file: Option<&str>,
        ctx: &CheckContext,
    ) -> Result<ReferenceReport> {
        let base = file
            .and_then(|f| Path::new(f).parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut seen = BTreeSet::new();
        let mut unresolved = Vec::new();
        for cap in RELATIVE_IMPORT_REGEX.captures_iter(code) {
            let Some(reference) = cap.get(1).map(|m| m.as_str()) else {
                continue;
            };
            if !seen.insert(reference.to_string()) {
                continue;
            }
            let Some(target) = normalize(&base.join(reference)) else {
                unresolved.push(UnresolvedReference {
                    reference: reference.to_string(),
                    suggestions: Vec::new(),
                });
                continue;
            };
            if !self.resolves(&target, ctx) {
                unresolved.push(UnresolvedReference {
                    reference: reference.to_string(),
                    suggestions: self.suggestions(&target, &ctx.execution_id),
                });
            }
        }

        Ok(ReferenceReport {
            passed: unresolved.is_empty(),
            unresolved,
        })
    }
}

fn index_files(root: &Path) -> Result<BTreeSet<String>> {
    if !root.is_dir() {
        bail!("cannot index {}: not a directory", root.display());
    }
    let mut files = BTreeSet::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !SKIPPED_DIRS.iter().any(|skipped| name == *skipped)
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root)
            && let Some(normalized) = normalize(relative)
        {
            files.insert(normalized);
        }
    }
    Ok(files)
}

/// Collapse `.` and `..` and join with `/`. `None` if the path escapes the root.
fn normalize(path: &Path) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}

fn candidates(target: &str) -> Vec<String> {
    let mut out = vec![target.to_string()];
    if Path::new(target).extension().is_none() {
        for ext in RESOLVE_EXTENSIONS {
            out.push(format!("{target}.{ext}"));
        }
        for ext in ["ts", "js"] {
            out.push(format!("{target}/index.{ext}"));
        }
    }
    out
}

fn file_stem(path: &str) -> Option<&str> {
    Path::new(path).file_stem().and_then(|s| s.to_str())
}

/// Scores claims by the share of claimed artifacts present in the checkout.
pub struct EvidenceTruth {
    threshold: f64,
    /// Executions with truth mode on.
    enabled: RwLock<HashSet<String>>,
}

impl EvidenceTruth {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            enabled: RwLock::new(HashSet::new()),
        }
    }
}

impl Default for EvidenceTruth {
    fn default() -> Self {
        Self::new(0.8)
    }
}

#[async_trait]
impl TruthChecker for EvidenceTruth {
    async fn enable(&self, ctx: &CheckContext) -> Result<()> {
        self.enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.execution_id.clone());
        Ok(())
    }

    fn forget(&self, execution_id: &str) {
        self.enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
    }

    async fn check(&self, ctx: &CheckContext, data: &serde_json::Value) -> Result<TruthVerdict> {
        let enabled = self
            .enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&ctx.execution_id);
        if !enabled {
            bail!("truth checking used before it was enabled");
        }

        let claimed: Vec<PathBuf> = data
            .get("artifacts")
            .and_then(|a| a.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        if claimed.is_empty() {
            return Ok(TruthVerdict {
                passed: true,
                confidence: 1.0,
                reason: None,
            });
        }

        let missing: Vec<String> = claimed
            .iter()
            .filter(|p| !ctx.root.join(p).exists())
            .map(|p| p.display().to_string())
            .collect();
        let confidence = (claimed.len() - missing.len()) as f64 / claimed.len() as f64;
        let passed = confidence >= self.threshold;

        Ok(TruthVerdict {
            passed,
            confidence,
            reason: (!passed).then(|| {
                format!(
                    "Confidence {:.2} below threshold {:.2}; missing artifacts: {}",
                    confidence,
                    self.threshold,
                    missing.join(", ")
                )
            }),
        })
    }
}
