//! Changeset spec reconstruction from a whole-execution cache result.
//!
//! The batch spec's changeset template is rendered against the execution's
//! outputs, and the execution diff is split per file so that
//! `transformChanges.group` entries can peel directories off into changesets
//! on their own branches. Everything here is pure: the same inputs always
//! produce the same specs in the same order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use db::models::{BatchSpecRow, NewChangesetSpec, WorkspaceRow};

use crate::PipelineError;

const HEADS_PREFIX: &str = "refs/heads/";
const FILE_DIFF_HEADER: &str = "diff --git ";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Decoded value of a `CACHE_RESULT` cache entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Unified diff of the whole execution, plain text.
    pub diff: String,
    pub changed_files: ChangedFiles,
    /// Named outputs produced by the steps, referenced by the template.
    pub outputs: BTreeMap<String, Value>,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangedFiles {
    pub modified: Option<Vec<String>>,
    pub added: Option<Vec<String>>,
    pub deleted: Option<Vec<String>>,
    pub renamed: Option<Vec<String>>,
}

impl ExecutionResult {
    pub fn decode(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|err| PipelineError::MalformedCacheValue(err.to_string()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChangesetTemplate {
    pub title: String,
    pub body: String,
    pub branch: String,
    pub commit: CommitTemplate,
    pub published: Option<Value>,
    #[serde(alias = "transform_changes")]
    pub transform_changes: Option<TransformChanges>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommitTemplate {
    pub message: String,
    pub author: Option<CommitAuthor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransformChanges {
    pub group: Vec<Group>,
}

/// Files under `directory` go to their own changeset on `branch`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Group {
    pub directory: String,
    pub branch: String,
    /// Restricts the group to one repository by name.
    pub repository: Option<String>,
}

// ---------------------------------------------------------------------------
// Template rendering
// ---------------------------------------------------------------------------

struct TemplateContext<'a> {
    outputs: &'a BTreeMap<String, Value>,
    repo_name: &'a str,
}

impl TemplateContext<'_> {
    fn resolve(&self, expr: &str) -> String {
        if expr == "repository.name" {
            return self.repo_name.to_string();
        }
        match expr.strip_prefix("outputs.").and_then(|name| self.outputs.get(name)) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Replace every `${{ expr }}` in `template`. Unknown expressions render empty.
    fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 3..];
            match after_open.find("}}") {
                Some(end) => {
                    out.push_str(&self.resolve(after_open[..end].trim()));
                    rest = &after_open[end + 2..];
                }
                None => {
                    // Unterminated: keep the remainder verbatim.
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

// ---------------------------------------------------------------------------
// Diff handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileDiff<'a> {
    path: &'a str,
    text: &'a str,
}

/// Split a unified diff into per-file sections. Concatenating the sections
/// reproduces the input exactly.
fn split_file_diffs(diff: &str) -> Vec<FileDiff<'_>> {
    let mut sections = Vec::new();
    let mut start = 0;
    let mut path = "";
    let mut offset = 0;

    for line in diff.split_inclusive('\n') {
        if let Some(header) = line.strip_prefix(FILE_DIFF_HEADER) {
            if offset > start {
                sections.push(FileDiff { path, text: &diff[start..offset] });
            }
            start = offset;
            path = header_path(header);
        }
        offset += line.len();
    }
    if offset > start {
        sections.push(FileDiff { path, text: &diff[start..offset] });
    }
    sections
}

/// Destination path from the remainder of a `diff --git a/x b/x` header.
fn header_path(header: &str) -> &str {
    let target = header.split_whitespace().last().unwrap_or_default();
    target.strip_prefix("b/").unwrap_or(target)
}

/// Added and deleted line counts, excluding file headers.
fn diff_stat(diff: &str) -> (i64, i64) {
    diff.lines().fold((0, 0), |(added, deleted), line| {
        if line.starts_with('+') && !line.starts_with("+++") {
            (added + 1, deleted)
        } else if line.starts_with('-') && !line.starts_with("---") {
            (added, deleted + 1)
        } else {
            (added, deleted)
        }
    })
}

fn directory_claims(directory: &str, path: &str) -> bool {
    let dir = directory.trim_matches('/');
    dir.is_empty() || dir == "." || path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn head_ref(branch: &str) -> String {
    if branch.starts_with(HEADS_PREFIX) {
        branch.to_string()
    } else {
        format!("{HEADS_PREFIX}{branch}")
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Build the changeset specs for one workspace's execution result.
///
/// An empty diff produces no specs. Otherwise the default spec (files not
/// claimed by any group) comes first, followed by one spec per group that
/// claimed at least one file, in declaration order.
pub fn build_changeset_specs(
    batch_spec: &BatchSpecRow,
    workspace: &WorkspaceRow,
    result: &ExecutionResult,
) -> Result<Vec<NewChangesetSpec>, PipelineError> {
    if result.diff.trim().is_empty() {
        return Ok(Vec::new());
    }

    let template: ChangesetTemplate = serde_json::from_value(batch_spec.changeset_template.0.clone())
        .map_err(|err| PipelineError::MalformedCacheValue(format!("changeset template: {err}")))?;

    let ctx = TemplateContext { outputs: &result.outputs, repo_name: &workspace.repo_name };

    let groups: Vec<&Group> = template
        .transform_changes
        .as_ref()
        .map(|t| t.group.iter())
        .into_iter()
        .flatten()
        .filter(|g| g.repository.as_deref().map_or(true, |repo| repo == workspace.repo_name))
        .collect();

    let mut default_diff = String::new();
    let mut group_diffs = vec![String::new(); groups.len()];

    for file in split_file_diffs(&result.diff) {
        let claimed_by = groups
            .iter()
            .enumerate()
            .filter(|(_, g)| directory_claims(&g.directory, file.path))
            .max_by_key(|(idx, g)| (g.directory.trim_matches('/').len(), std::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx);

        match claimed_by {
            Some(idx) => group_diffs[idx].push_str(file.text),
            None => default_diff.push_str(file.text),
        }
    }

    let build = |branch: String, diff: String| {
        let (added, deleted) = diff_stat(&diff);
        let author = template.commit.author.clone().unwrap_or_default();
        NewChangesetSpec {
            batch_spec_id: batch_spec.id,
            repo_id: workspace.repo_id,
            user_id: batch_spec.user_id,
            base_ref: workspace.branch.clone(),
            base_rev: workspace.commit_sha.clone(),
            head_ref: head_ref(&branch),
            title: ctx.render(&template.title),
            body: ctx.render(&template.body),
            commit_message: ctx.render(&template.commit.message),
            commit_author_name: ctx.render(&author.name),
            commit_author_email: ctx.render(&author.email),
            published: template.published.clone(),
            diff,
            diff_stat_added: added,
            diff_stat_deleted: deleted,
        }
    };

    let mut specs = Vec::new();
    if !default_diff.is_empty() {
        specs.push(build(ctx.render(&template.branch), default_diff));
    }
    for (group, diff) in groups.iter().zip(group_diffs) {
        if !diff.is_empty() {
            specs.push(build(ctx.render(&group.branch), diff));
        }
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use sqlx::types::Json;

    use super::*;

    const README_DIFF: &str = "diff --git a/README.md b/README.md\n--- a/README.md\n+++ b/README.md\n@@ -1 +1,2 @@\n-old\n+new\n+line\n";
    const DOCS_DIFF: &str = "diff --git a/docs/guide.md b/docs/guide.md\n--- a/docs/guide.md\n+++ b/docs/guide.md\n@@ -1 +1 @@\n+guide\n";
    const API_DOCS_DIFF: &str = "diff --git a/docs/api/index.md b/docs/api/index.md\n--- a/docs/api/index.md\n+++ b/docs/api/index.md\n@@ -1 +1 @@\n+api\n";

    fn batch_spec(template: Value) -> BatchSpecRow {
        BatchSpecRow {
            id: 10,
            user_id: 3,
            allow_unsupported: false,
            allow_ignored: false,
            changeset_template: Json(template),
            created_at: Utc::now(),
        }
    }

    fn workspace() -> WorkspaceRow {
        WorkspaceRow {
            id: 1,
            batch_spec_id: 10,
            repo_id: 42,
            repo_name: "github.com/acme/api".into(),
            branch: "refs/heads/main".into(),
            commit_sha: "c0ffee".into(),
            path: String::new(),
            file_matches: Json(vec![]),
            steps: Json(vec![]),
            only_fetch_workspace: false,
            unsupported: false,
            ignored: false,
            skipped: false,
            cached_result_found: false,
            step_cache_results: Json(BTreeMap::new()),
            changeset_spec_ids: Json(vec![]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn template() -> Value {
        json!({
            "title": "Update ${{ repository.name }}",
            "body": "Wrote ${{ outputs.file }} (${{ outputs.count }}) ${{ batch_change.name }}",
            "branch": "batch/update",
            "commit": {"message": "update", "author": {"name": "Bot", "email": "bot@example.com"}},
            "published": false
        })
    }

    fn result(diff: &str) -> ExecutionResult {
        ExecutionResult {
            diff: diff.to_string(),
            outputs: BTreeMap::from([
                ("file".to_string(), json!("out.txt")),
                ("count".to_string(), json!(2)),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn renders_template_and_refs() {
        let specs = build_changeset_specs(&batch_spec(template()), &workspace(), &result(README_DIFF)).unwrap();
        assert_eq!(specs.len(), 1);

        let spec = &specs[0];
        assert_eq!(spec.title, "Update github.com/acme/api");
        assert_eq!(spec.body, "Wrote out.txt (2) ");
        assert_eq!(spec.head_ref, "refs/heads/batch/update");
        assert_eq!(spec.base_ref, "refs/heads/main");
        assert_eq!(spec.base_rev, "c0ffee");
        assert_eq!(spec.commit_author_email, "bot@example.com");
        assert_eq!(spec.published, Some(json!(false)));
        assert_eq!((spec.diff_stat_added, spec.diff_stat_deleted), (2, 1));
        assert_eq!(spec.diff, README_DIFF);
        assert_eq!((spec.batch_spec_id, spec.repo_id, spec.user_id), (10, 42, 3));
    }

    #[test]
    fn empty_diff_builds_nothing() {
        let specs = build_changeset_specs(&batch_spec(template()), &workspace(), &result("")).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn groups_split_files_by_longest_directory() {
        let mut tmpl = template();
        tmpl["transformChanges"] = json!({"group": [
            {"directory": "docs", "branch": "batch/docs"},
            {"directory": "docs/api", "branch": "batch/api-docs"},
            {"directory": "src", "branch": "batch/src"},
            {"directory": "README.md", "branch": "batch/elsewhere", "repository": "github.com/acme/web"}
        ]});
        let diff = format!("{README_DIFF}{DOCS_DIFF}{API_DOCS_DIFF}");

        let specs = build_changeset_specs(&batch_spec(tmpl), &workspace(), &result(&diff)).unwrap();
        let branches: Vec<&str> = specs.iter().map(|s| s.head_ref.as_str()).collect();
        assert_eq!(branches, vec!["refs/heads/batch/update", "refs/heads/batch/docs", "refs/heads/batch/api-docs"]);
        assert_eq!(specs[0].diff, README_DIFF);
        assert_eq!(specs[1].diff, DOCS_DIFF);
        assert_eq!(specs[2].diff, API_DOCS_DIFF);
    }

    #[test]
    fn group_claiming_everything_leaves_no_default_spec() {
        let mut tmpl = template();
        tmpl["transform_changes"] = json!({"group": [{"directory": "docs", "branch": "refs/heads/docs-only"}]});

        let specs = build_changeset_specs(&batch_spec(tmpl), &workspace(), &result(DOCS_DIFF)).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].head_ref, "refs/heads/docs-only");
    }

    #[test]
    fn split_handles_unprefixed_headers() {
        let diff = "diff --git README.txt README.txt\nnew file mode 100644\n+hi\ndiff --git a/x/y b/x/y\n-bye\n";
        let files = split_file_diffs(diff);
        assert_eq!(files.iter().map(|f| f.path).collect::<Vec<_>>(), vec!["README.txt", "x/y"]);
        assert_eq!(files.iter().map(|f| f.text).collect::<String>(), diff);
    }

    #[test]
    fn unterminated_placeholder_is_kept() {
        let outputs = BTreeMap::new();
        let ctx = TemplateContext { outputs: &outputs, repo_name: "r" };
        assert_eq!(ctx.render("a ${{ repository.name }} b ${{ oops"), "a r b ${{ oops");
    }

    #[test]
    fn malformed_result_payload_is_rejected() {
        let err = ExecutionResult::decode(r#"{"diff": 12}"#).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedCacheValue(_)));
    }
}
