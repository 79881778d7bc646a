//! Boot menu rewriting.
//!
//! isolinux and GRUB menus on the disk name the live kernel, the initrd and
//! the `boot=` directory explicitly. After the user picks a kernel, every
//! such reference must point at the files the assembler copies onto the disk.
//!
//! Lines are matched on their first word, case-insensitively:
//!
//! | Directive | Rewritten |
//! |-----------|-----------|
//! | `APPEND`  | `initrd=` value, `boot=` value (appended when missing) |
//! | `LINUX*`  | vmlinuz path, `boot=` value (appended when missing and no `APPEND` follows) |
//! | `KERNEL`  | vmlinuz path |
//! | `INITRD*` | initrd path |
//!
//! `boot=` is never appended for subiquity installers. Every other line is
//! left alone.

mod edit;
mod files;

pub use edit::{apply_edits, TextEdit};
pub use files::{find_boot_configurations, rewrite_boot_config_files, BOOT_CONFIG_DIRECTORIES};

use crate::error::ValidationError;
use crate::kernel::KernelEntry;
use crate::layout::LayoutProfile;

/// What the rewritten references point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteParams {
    pub casper_directory: String,
    pub squashfs_directory: String,
    pub vmlinuz_name: String,
    pub initrd_name: String,
    pub has_subiquity: bool,
}

impl RewriteParams {
    pub fn new(layout: &LayoutProfile, kernel: &KernelEntry) -> Result<Self, ValidationError> {
        let casper_directory = layout
            .casper_directory
            .clone()
            .ok_or(ValidationError::MissingLayout("casper directory"))?;
        let squashfs_directory = layout
            .squashfs_directory
            .clone()
            .ok_or(ValidationError::MissingLayout("squashfs directory"))?;
        Ok(Self {
            casper_directory,
            squashfs_directory,
            vmlinuz_name: kernel.vmlinuz_target_name.clone(),
            initrd_name: kernel.initrd_target_name.clone(),
            has_subiquity: layout.has_subiquity(),
        })
    }

    fn vmlinuz_path(&self) -> String {
        format!("/{}/{}", self.casper_directory.trim_matches('/'), self.vmlinuz_name)
    }

    fn initrd_path(&self) -> String {
        format!("/{}/{}", self.casper_directory.trim_matches('/'), self.initrd_name)
    }

    /// Only the leading path component: Grml boots with `boot=live` but keeps
    /// its image in `live/grml64-full`.
    fn boot_argument(&self) -> &str {
        self.squashfs_directory
            .split('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.squashfs_directory)
    }
}

/// Result of rewriting one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rewrite {
    pub text: String,
    pub edits: Vec<TextEdit>,
    pub update_count: usize,
}

impl Rewrite {
    pub fn is_changed(&self, original: &str) -> bool {
        self.text != original
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Append,
    Linux,
    Kernel,
    Initrd,
}

impl Directive {
    fn parse(word: &str) -> Option<Self> {
        let word = word.to_ascii_lowercase();
        let suffix_ok = |rest: &str| rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if word == "append" {
            Some(Directive::Append)
        } else if word.strip_prefix("linux").is_some_and(suffix_ok) {
            Some(Directive::Linux)
        } else if word == "kernel" {
            Some(Directive::Kernel)
        } else if word.strip_prefix("initrd").is_some_and(suffix_ok) {
            Some(Directive::Initrd)
        } else {
            None
        }
    }
}

/// A whitespace-delimited word and its byte range within the line.
#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    start: usize,
    text: &'a str,
}

fn tokens(line: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                out.push(Token { start: s, text: &line[s..i] });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push(Token { start: s, text: &line[s..] });
    }
    out
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

/// Value range of the first `key=` token whose value satisfies `accept`.
fn find_argument(
    words: &[Token<'_>],
    key: &str,
    accept: impl Fn(&str) -> bool,
) -> Option<(usize, usize)> {
    words.iter().skip(1).find_map(|word| {
        let split = key.len();
        let is_key = word.text.len() >= split
            && word.text.is_char_boundary(split)
            && word.text[..split].eq_ignore_ascii_case(key);
        if !is_key {
            return None;
        }
        let value = &word.text[split..];
        accept(value).then(|| (word.start + split, word.text.len() - split))
    })
}

/// Range of the first argument word containing `needle`.
fn find_path(words: &[Token<'_>], needle: &str) -> Option<(usize, usize)> {
    words
        .iter()
        .skip(1)
        .find(|w| contains_ignore_case(w.text, needle))
        .map(|w| (w.start, w.text.len()))
}

/// Pending replacements in one line, by range in the original line.
struct LineEdits {
    replacements: Vec<(usize, usize, String)>,
    append: Option<String>,
}

impl LineEdits {
    fn new() -> Self {
        Self {
            replacements: Vec::new(),
            append: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.replacements.is_empty() && self.append.is_none()
    }
}

fn plan_line(
    content: &str,
    next_is_append: bool,
    params: &RewriteParams,
    line_number: usize,
) -> Option<LineEdits> {
    let words = tokens(content);
    let directive = Directive::parse(words.first()?.text)?;
    let mut edits = LineEdits::new();

    let target = match directive {
        Directive::Append => find_argument(&words, "initrd=", |v| contains_ignore_case(v, "initrd"))
            .map(|range| (range, params.initrd_path())),
        Directive::Linux | Directive::Kernel => {
            find_path(&words, "vmlinuz").map(|range| (range, params.vmlinuz_path()))
        }
        Directive::Initrd => find_path(&words, "initrd").map(|range| (range, params.initrd_path())),
    };
    let Some(((start, len), replacement)) = target else {
        log::warn!(
            "Line {}: no kernel or initrd reference in '{}', leaving it unchanged",
            line_number,
            content.trim()
        );
        return None;
    };
    edits.replacements.push((start, len, replacement));

    if matches!(directive, Directive::Append | Directive::Linux) {
        match find_argument(&words, "boot=", |_| true) {
            Some((start, len)) => {
                edits
                    .replacements
                    .push((start, len, params.boot_argument().to_string()));
            }
            None => {
                let may_append = !params.has_subiquity
                    && (directive == Directive::Append || !next_is_append);
                if may_append {
                    edits.append = Some(format!(" boot={}", params.boot_argument()));
                }
            }
        }
    }

    edits.replacements.sort_by_key(|(start, _, _)| *start);
    Some(edits)
}

/// Split a line into content and its terminator (`\n`, `\r\n` or nothing).
fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}

fn first_word_is_append(line: &str) -> bool {
    tokens(line)
        .first()
        .is_some_and(|w| w.text.eq_ignore_ascii_case("append"))
}

/// Rewrite every kernel, initrd and `boot=` reference in `text`.
pub fn rewrite_boot_config(text: &str, params: &RewriteParams) -> Rewrite {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut rewrite = Rewrite {
        text: String::with_capacity(text.len() + 64),
        ..Rewrite::default()
    };

    for (index, line) in lines.iter().enumerate() {
        let (content, terminator) = split_terminator(line);
        let next_is_append = lines.get(index + 1).is_some_and(|l| first_word_is_append(l));

        let plan = plan_line(content, next_is_append, params, index + 1).filter(|p| !p.is_empty());
        let Some(plan) = plan else {
            rewrite.text.push_str(line);
            continue;
        };

        let mut cursor = 0;
        for (start, len, replacement) in plan.replacements {
            rewrite.text.push_str(&content[cursor..start]);
            let edit = TextEdit {
                offset: rewrite.text.len(),
                delete_len: len,
                insert_text: replacement,
                highlight: true,
            };
            rewrite.update_count += edit.update_count();
            rewrite.text.push_str(&edit.insert_text);
            rewrite.edits.push(edit);
            cursor = start + len;
        }
        rewrite.text.push_str(&content[cursor..]);

        if let Some(appended) = plan.append {
            let edit = TextEdit {
                offset: rewrite.text.len(),
                delete_len: 0,
                insert_text: appended,
                highlight: true,
            };
            rewrite.update_count += edit.update_count();
            rewrite.text.push_str(&edit.insert_text);
            rewrite.edits.push(edit);
        }
        rewrite.text.push_str(terminator);
    }

    rewrite
}
