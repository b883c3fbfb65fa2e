//! Workspace-confined file tools.
//!
//! Every mutating tool resolves its path through the jail, then takes the
//! per-file write lock before touching the filesystem.  Reads do not lock.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{ErrorKind, ToolError};
use crate::workspace::resolve_in_workspace;

use super::traits::{Tool, ToolContext, ToolResult, required_str};

/// Lines of context shown on each side of an edit.
const SNIPPET_CONTEXT: usize = 3;

/// Bytes inspected for the binary (NUL) check.
const BINARY_SNIFF_LEN: usize = 8192;

// ─── CreateFileTool ──────────────────────────────────────────────────────────

pub struct CreateFileTool;

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace with the given UTF-8 content. \
         Intermediate directories are created as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":    { "type": "string", "description": "Path relative to the workspace." },
                "content": { "type": "string", "description": "Full file content." }
            },
            "required": ["path", "content"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        path_detail(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let rel = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let path = resolve_in_workspace(&ctx.workspace, rel)?;

        ctx.note_step(format!("Awaiting file lock on {rel}"));
        let guard = ctx.manager.acquire_file_lock(&path, ctx.lock_timeout).await?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ToolError::new(ErrorKind::PathTraversal, format!("cannot create dirs: {e}"))
            })?;
        }
        std::fs::write(&path, content).map_err(io_error(&path))?;
        ctx.manager.release_file_lock(guard);

        Ok(ToolResult::ok(format!(
            "wrote {} bytes to {rel}",
            content.len()
        ))
        .with_metadata(json!({ "path": rel, "action": "create" })))
    }
}

// ─── StrReplaceTool ──────────────────────────────────────────────────────────

pub struct StrReplaceTool;

#[async_trait]
impl Tool for StrReplaceTool {
    fn name(&self) -> &str {
        "str_replace"
    }

    fn description(&self) -> &str {
        "Replace one unique occurrence of a string in a file. Fails if the string \
         is absent or appears more than once; returns a snippet around the edit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace." },
                "old":  { "type": "string", "description": "Exact string to replace (must be unique)." },
                "new":  { "type": "string", "description": "Replacement string." }
            },
            "required": ["path", "old", "new"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        path_detail(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let rel = required_str(&args, "path")?;
        let old = required_str(&args, "old")?;
        let new = required_str(&args, "new")?;
        let path = resolve_in_workspace(&ctx.workspace, rel)?;

        ctx.note_step(format!("Awaiting file lock on {rel}"));
        let guard = ctx.manager.acquire_file_lock(&path, ctx.lock_timeout).await?;

        let content = read_text(&path)?;
        match content.matches(old).count() {
            0 => {
                return Err(ToolError::new(
                    ErrorKind::StringNotFound,
                    format!("'{}' does not occur in {rel}", preview(old)),
                ));
            }
            1 => {}
            n => {
                return Err(ToolError::new(
                    ErrorKind::AmbiguousMatch,
                    format!("'{}' occurs {n} times in {rel}; make it unique", preview(old)),
                ));
            }
        }

        let replaced = content.replacen(old, new, 1);
        std::fs::write(&path, &replaced).map_err(io_error(&path))?;
        ctx.manager.release_file_lock(guard);

        let snippet = snippet_around(&replaced, replaced.find(new).unwrap_or(0));
        Ok(ToolResult::ok(format!("edited {rel}\n{snippet}"))
            .with_metadata(json!({ "path": rel, "action": "str_replace" })))
    }
}

// ─── StrReplaceAllTool ───────────────────────────────────────────────────────

pub struct StrReplaceAllTool;

#[async_trait]
impl Tool for StrReplaceAllTool {
    fn name(&self) -> &str {
        "str_replace_all"
    }

    fn description(&self) -> &str {
        "Replace every occurrence of a string in a file. Fails if the string is absent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace." },
                "old":  { "type": "string", "description": "String to replace." },
                "new":  { "type": "string", "description": "Replacement string." }
            },
            "required": ["path", "old", "new"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        path_detail(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let rel = required_str(&args, "path")?;
        let old = required_str(&args, "old")?;
        let new = required_str(&args, "new")?;
        let path = resolve_in_workspace(&ctx.workspace, rel)?;

        ctx.note_step(format!("Awaiting file lock on {rel}"));
        let guard = ctx.manager.acquire_file_lock(&path, ctx.lock_timeout).await?;

        let content = read_text(&path)?;
        let count = content.matches(old).count();
        if count == 0 {
            return Err(ToolError::new(
                ErrorKind::StringNotFound,
                format!("'{}' does not occur in {rel}", preview(old)),
            ));
        }

        std::fs::write(&path, content.replace(old, new)).map_err(io_error(&path))?;
        ctx.manager.release_file_lock(guard);
        Ok(ToolResult::ok(format!("replaced {count} occurrences in {rel}"))
            .with_metadata(json!({ "path": rel, "action": "str_replace_all", "count": count })))
    }
}

// ─── InsertAtTool ────────────────────────────────────────────────────────────

pub struct InsertAtTool;

#[async_trait]
impl Tool for InsertAtTool {
    fn name(&self) -> &str {
        "insert_at"
    }

    fn description(&self) -> &str {
        "Insert content before or after a given 1-based line number."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":     { "type": "string", "description": "Path relative to the workspace." },
                "line":     { "type": "integer", "description": "1-based anchor line.", "minimum": 1 },
                "position": { "type": "string", "enum": ["before", "after"] },
                "content":  { "type": "string", "description": "Lines to insert." }
            },
            "required": ["path", "line", "content"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        path_detail(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let rel = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let line = args.get("line").and_then(Value::as_u64).ok_or_else(|| {
            ToolError::new(ErrorKind::InvalidArguments, "missing required argument 'line'")
        })? as usize;
        let after = args.get("position").and_then(Value::as_str) == Some("after");
        let path = resolve_in_workspace(&ctx.workspace, rel)?;

        ctx.note_step(format!("Awaiting file lock on {rel}"));
        let guard = ctx.manager.acquire_file_lock(&path, ctx.lock_timeout).await?;

        let text = read_text(&path)?;
        let mut lines: Vec<&str> = text.lines().collect();
        if line == 0 || line > lines.len() {
            return Err(ToolError::new(
                ErrorKind::InvalidArguments,
                format!("line {line} out of range (file has {} lines)", lines.len()),
            ));
        }

        let insert_at = if after { line } else { line - 1 };
        let inserted: Vec<&str> = content.lines().collect();
        let n = inserted.len();
        lines.splice(insert_at..insert_at, inserted);

        std::fs::write(&path, join_lines(&lines, text.ends_with('\n'))).map_err(io_error(&path))?;
        ctx.manager.release_file_lock(guard);
        Ok(ToolResult::ok(format!(
            "inserted {n} line(s) {} line {line} in {rel}",
            if after { "after" } else { "before" }
        ))
        .with_metadata(json!({ "path": rel, "action": "insert_at" })))
    }
}

// ─── ReplaceLinesTool ────────────────────────────────────────────────────────

pub struct ReplaceLinesTool;

#[async_trait]
impl Tool for ReplaceLinesTool {
    fn name(&self) -> &str {
        "replace_lines"
    }

    fn description(&self) -> &str {
        "Replace an inclusive 1-based line range with new content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":    { "type": "string", "description": "Path relative to the workspace." },
                "start":   { "type": "integer", "minimum": 1 },
                "end":     { "type": "integer", "minimum": 1 },
                "content": { "type": "string", "description": "Replacement lines." }
            },
            "required": ["path", "start", "end", "content"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        path_detail(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let rel = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let start = args.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;
        let end = args.get("end").and_then(Value::as_u64).unwrap_or(0) as usize;
        let path = resolve_in_workspace(&ctx.workspace, rel)?;

        ctx.note_step(format!("Awaiting file lock on {rel}"));
        let guard = ctx.manager.acquire_file_lock(&path, ctx.lock_timeout).await?;

        let text = read_text(&path)?;
        let mut lines: Vec<&str> = text.lines().collect();
        if start == 0 || end < start || end > lines.len() {
            return Err(ToolError::new(
                ErrorKind::InvalidArguments,
                format!("range {start}..{end} invalid (file has {} lines)", lines.len()),
            ));
        }

        lines.splice(start - 1..end, content.lines());
        std::fs::write(&path, join_lines(&lines, text.ends_with('\n'))).map_err(io_error(&path))?;
        ctx.manager.release_file_lock(guard);
        Ok(ToolResult::ok(format!("replaced lines {start}-{end} in {rel}"))
            .with_metadata(json!({ "path": rel, "action": "replace_lines" })))
    }
}

// ─── ViewTool ────────────────────────────────────────────────────────────────

pub struct ViewTool;

#[async_trait]
impl Tool for ViewTool {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace as numbered lines. Use offset and \
         limit to page through large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path":   { "type": "string", "description": "Path relative to the workspace." },
                "offset": { "type": "integer", "description": "1-based first line (default 1).", "minimum": 1 },
                "limit":  { "type": "integer", "description": "Maximum lines to return.", "minimum": 1 }
            },
            "required": ["path"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        path_detail(args)
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let rel = required_str(&args, "path")?;
        let path = resolve_in_workspace(&ctx.workspace, rel)?;

        // Reads do not take the write lock.
        let bytes = std::fs::read(&path).map_err(io_error(&path))?;
        if bytes.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0) {
            return Err(ToolError::new(
                ErrorKind::BinaryFile,
                format!("{rel} is binary"),
            ));
        }
        let text = String::from_utf8_lossy(&bytes);

        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(1) as usize;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX);

        let total = text.lines().count();
        let numbered: Vec<String> = text
            .lines()
            .enumerate()
            .skip(offset.saturating_sub(1))
            .take(limit)
            .map(|(i, line)| format!("{:>6}  {line}", i + 1))
            .collect();

        Ok(ToolResult::ok(numbered.join("\n"))
            .with_metadata(json!({ "path": rel, "action": "view", "total_lines": total })))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn path_detail(args: &Value) -> String {
    args.get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn read_text(path: &Path) -> Result<String, ToolError> {
    let bytes = std::fs::read(path).map_err(io_error(path))?;
    if bytes.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0) {
        return Err(ToolError::new(
            ErrorKind::BinaryFile,
            format!("{} is binary", path.display()),
        ));
    }
    String::from_utf8(bytes).map_err(|_| {
        ToolError::new(
            ErrorKind::BinaryFile,
            format!("{} is not valid UTF-8", path.display()),
        )
    })
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ToolError + '_ {
    move |e| {
        let kind = if e.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::FileNotFoundInWorkspace
        } else {
            ErrorKind::PathTraversal
        };
        ToolError::new(kind, format!("{}: {e}", path.display()))
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > 40 {
        let cut: String = s.chars().take(40).collect();
        format!("{cut}…")
    } else {
        s.to_owned()
    }
}

fn join_lines(lines: &[&str], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    out
}

/// Numbered snippet of ±3 lines around the byte offset `at`.
fn snippet_around(content: &str, at: usize) -> String {
    let line_idx = content[..at.min(content.len())].matches('\n').count();
    let start = line_idx.saturating_sub(SNIPPET_CONTEXT);
    content
        .lines()
        .enumerate()
        .skip(start)
        .take(SNIPPET_CONTEXT * 2 + 1)
        .map(|(i, line)| format!("{:>6}  {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::test_context;
    use tempfile::TempDir;

    async fn run(tool: &dyn Tool, ws: &TempDir, args: Value) -> Result<ToolResult, ToolError> {
        let ctx = test_context(ws.path()).await;
        tool.execute(&ctx, args).await
    }

    // ── create_file / view round trip ───────────────────────────────────

    #[tokio::test]
    async fn create_then_view_round_trips() {
        let ws = TempDir::new().unwrap();
        run(
            &CreateFileTool,
            &ws,
            json!({"path": "notes/a.md", "content": "alpha\nbeta"}),
        )
        .await
        .unwrap();

        let r = run(&ViewTool, &ws, json!({"path": "notes/a.md"})).await.unwrap();
        assert!(r.output.contains("1  alpha"));
        assert!(r.output.contains("2  beta"));
    }

    #[tokio::test]
    async fn create_overwrites() {
        let ws = TempDir::new().unwrap();
        run(&CreateFileTool, &ws, json!({"path": "a.md", "content": "one"}))
            .await
            .unwrap();
        run(&CreateFileTool, &ws, json!({"path": "a.md", "content": "two"}))
            .await
            .unwrap();
        let content = std::fs::read_to_string(ws.path().join("a.md")).unwrap();
        assert_eq!(content, "two");
    }

    #[tokio::test]
    async fn create_rejects_escape() {
        let ws = TempDir::new().unwrap();
        let err = run(
            &CreateFileTool,
            &ws,
            json!({"path": "../evil.md", "content": "x"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PathTraversal);
    }

    // ── str_replace boundaries ──────────────────────────────────────────

    #[tokio::test]
    async fn str_replace_unique_succeeds_with_snippet() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "one\ntwo\nthree\nfour\nfive\nsix\nseven\n")
            .unwrap();
        let r = run(
            &StrReplaceTool,
            &ws,
            json!({"path": "a.md", "old": "four", "new": "FOUR"}),
        )
        .await
        .unwrap();
        assert!(r.output.contains("FOUR"));
        // Context lines around the edit appear in the snippet.
        assert!(r.output.contains("three"));
        assert!(r.output.contains("seven"));
        let content = std::fs::read_to_string(ws.path().join("a.md")).unwrap();
        assert!(content.contains("FOUR"));
    }

    #[tokio::test]
    async fn str_replace_zero_matches_fails() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "hello").unwrap();
        let err = run(
            &StrReplaceTool,
            &ws,
            json!({"path": "a.md", "old": "absent", "new": "x"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StringNotFound);
    }

    #[tokio::test]
    async fn str_replace_multiple_matches_fails() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "dup dup").unwrap();
        let err = run(
            &StrReplaceTool,
            &ws,
            json!({"path": "a.md", "old": "dup", "new": "x"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AmbiguousMatch);
    }

    #[tokio::test]
    async fn str_replace_inverts() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "alpha beta gamma").unwrap();
        run(
            &StrReplaceTool,
            &ws,
            json!({"path": "a.md", "old": "beta", "new": "delta"}),
        )
        .await
        .unwrap();
        run(
            &StrReplaceTool,
            &ws,
            json!({"path": "a.md", "old": "delta", "new": "beta"}),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a.md")).unwrap(),
            "alpha beta gamma"
        );
    }

    #[tokio::test]
    async fn str_replace_missing_file() {
        let ws = TempDir::new().unwrap();
        let err = run(
            &StrReplaceTool,
            &ws,
            json!({"path": "ghost.md", "old": "a", "new": "b"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileNotFoundInWorkspace);
    }

    // ── str_replace_all / insert_at / replace_lines ─────────────────────

    #[tokio::test]
    async fn str_replace_all_replaces_every_occurrence() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "x y x y x").unwrap();
        let r = run(
            &StrReplaceAllTool,
            &ws,
            json!({"path": "a.md", "old": "x", "new": "z"}),
        )
        .await
        .unwrap();
        assert!(r.output.contains("3 occurrences"));
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a.md")).unwrap(),
            "z y z y z"
        );
    }

    #[tokio::test]
    async fn insert_before_and_after() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "one\ntwo\n").unwrap();
        run(
            &InsertAtTool,
            &ws,
            json!({"path": "a.md", "line": 2, "position": "before", "content": "mid"}),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a.md")).unwrap(),
            "one\nmid\ntwo\n"
        );

        run(
            &InsertAtTool,
            &ws,
            json!({"path": "a.md", "line": 3, "position": "after", "content": "end"}),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a.md")).unwrap(),
            "one\nmid\ntwo\nend\n"
        );
    }

    #[tokio::test]
    async fn insert_out_of_range_fails() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "one\n").unwrap();
        let err = run(
            &InsertAtTool,
            &ws,
            json!({"path": "a.md", "line": 9, "content": "x"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn replace_lines_inclusive_range() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.md"), "1\n2\n3\n4\n").unwrap();
        run(
            &ReplaceLinesTool,
            &ws,
            json!({"path": "a.md", "start": 2, "end": 3, "content": "x"}),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a.md")).unwrap(),
            "1\nx\n4\n"
        );
    }

    // ── view ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn view_rejects_binary() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("bin"), [0x7fu8, b'E', 0x00, b'F']).unwrap();
        let err = run(&ViewTool, &ws, json!({"path": "bin"})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BinaryFile);
    }

    #[tokio::test]
    async fn view_offset_and_limit() {
        let ws = TempDir::new().unwrap();
        let body: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        std::fs::write(ws.path().join("a.md"), body).unwrap();

        let r = run(&ViewTool, &ws, json!({"path": "a.md", "offset": 4, "limit": 2}))
            .await
            .unwrap();
        assert!(r.output.contains("4  line4"));
        assert!(r.output.contains("5  line5"));
        assert!(!r.output.contains("line6"));
        assert_eq!(r.metadata.unwrap()["total_lines"], 10);
    }

    #[tokio::test]
    async fn view_missing_file() {
        let ws = TempDir::new().unwrap();
        let err = run(&ViewTool, &ws, json!({"path": "nope.md"})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileNotFoundInWorkspace);
    }

    // ── lock contention ─────────────────────────────────────────────────

    #[tokio::test]
    async fn mutating_op_times_out_when_lock_is_held() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("x.md"), "A").unwrap();
        let mut ctx = test_context(ws.path()).await;
        ctx.lock_timeout = std::time::Duration::from_millis(50);

        let path = crate::workspace::resolve_in_workspace(&ctx.workspace, "x.md").unwrap();
        let guard = ctx
            .manager
            .acquire_file_lock(&path, std::time::Duration::from_secs(1))
            .await
            .unwrap();

        // The lock is held elsewhere; the edit fails with a kind the model
        // can react to instead of hanging.
        let err = StrReplaceTool
            .execute(&ctx, json!({"path": "x.md", "old": "A", "new": "B"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockTimeout);
        assert_eq!(std::fs::read_to_string(ws.path().join("x.md")).unwrap(), "A");

        // Once released, the same edit goes through.
        ctx.manager.release_file_lock(guard);
        StrReplaceTool
            .execute(&ctx, json!({"path": "x.md", "old": "A", "new": "B"}))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(ws.path().join("x.md")).unwrap(), "B");
    }

    // ── action details ──────────────────────────────────────────────────

    #[test]
    fn detail_is_the_relative_path() {
        let args = json!({"path": "src/x.rs", "content": "y"});
        assert_eq!(CreateFileTool.build_detail(&args), "src/x.rs");
        assert_eq!(ViewTool.build_detail(&args), "src/x.rs");
    }
}
