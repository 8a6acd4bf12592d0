//! Conservative read/write heuristic for shell command strings.
//!
//! The heuristic only answers "read" when it can positively identify every
//! part of the command as read-only. Unknown binaries, unparsable input,
//! redirections and most pipelines are writes.

use std::path::Path;

/// Terminal pipeline stages that only display their input.
const PAGERS: &[&str] = &["less", "more"];

/// Binaries that always mutate something.
const WRITE_BINARIES: &[&str] = &[
    "rm", "rmdir", "mv", "cp", "mkdir", "touch", "chmod", "chown", "chgrp", "ln", "dd",
    "truncate", "shred", "install", "tee", "kill", "killall", "pkill", "unlink", "rsync", "scp",
    "patch", "make", "apt", "apt-get", "dpkg", "yum", "dnf", "pacman", "apk", "brew", "snap",
    "pip", "pip3", "pipx", "uv", "poetry", "npm", "npx", "pnpm", "yarn", "bun", "gem", "bundle",
    "cargo", "go", "composer", "conda",
];

/// Binaries that only read.
const READ_BINARIES: &[&str] = &[
    "ls", "cat", "head", "tail", "less", "more", "grep", "egrep", "fgrep", "rg", "ag", "pwd",
    "echo", "printf", "wc", "which", "whoami", "date", "tree", "stat", "file", "du", "df", "diff",
    "uname", "hostname", "id", "ps", "realpath", "readlink", "dirname", "basename", "jq", "sort",
    "uniq", "cut", "tr", "column", "nl", "fd", "true", "false", "test", "type", "cal",
];

/// Git subcommands that mutate the repository or a remote.
const GIT_WRITE_SUBCOMMANDS: &[&str] = &[
    "add", "commit", "push", "pull", "fetch", "merge", "rebase", "reset", "checkout", "switch",
    "restore", "rm", "mv", "stash", "tag", "cherry-pick", "revert", "clean", "init", "clone", "am",
    "apply", "gc", "prune", "submodule", "worktree", "notes", "bisect", "filter-branch",
];

/// Git subcommands that only read, subject to the `branch`/`config` checks.
const GIT_READ_SUBCOMMANDS: &[&str] = &[
    "status", "log", "diff", "show", "branch", "config", "blame", "grep", "ls-files", "ls-tree",
    "ls-remote", "rev-parse", "rev-list", "describe", "shortlog", "reflog", "cat-file", "help",
    "version", "whatchanged",
];

/// `find` predicates that act on matches instead of printing them.
const FIND_ACTION_PREDICATES: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir", "-fls"];

/// Returns `true` if running `command` may mutate state.
pub fn is_write_command(command: &str) -> bool {
    classify_command(command, false)
}

/// Classifies a shell command; `true` means write.
///
/// `installing_dependencies` forces a write regardless of the command text.
pub fn classify_command(command: &str, installing_dependencies: bool) -> bool {
    if installing_dependencies {
        return true;
    }

    let Some(segments) = split_unquoted(command) else {
        return true;
    };
    if segments.iter().all(|s| s.stages.iter().all(|st| st.trim().is_empty())) {
        return true;
    }

    segments.iter().any(|segment| {
        if segment.redirects {
            return true;
        }
        pipeline_is_write(&segment.stages)
    })
}

fn pipeline_is_write(stages: &[String]) -> bool {
    match stages {
        [] => true,
        [single] => stage_is_write(single),
        [rest @ .., last] => {
            let Some(words) = words(last) else {
                return true;
            };
            let is_pager = words
                .first()
                .is_some_and(|program| PAGERS.contains(&basename(program)));
            if !is_pager {
                return true;
            }
            rest.iter().any(|stage| stage_is_write(stage))
        }
    }
}

fn stage_is_write(stage: &str) -> bool {
    let Some(words) = words(stage) else {
        return true;
    };
    words_are_write(&words)
}

/// Shell-word splits a stage after unwrapping assignments and `sudo`.
fn words(stage: &str) -> Option<Vec<String>> {
    let parts = shlex::split(stage.trim())?;
    let mut iter = parts
        .into_iter()
        .skip_while(|w| is_assignment(w))
        .peekable();

    if iter.peek().map(String::as_str) == Some("sudo") {
        iter.next();
        while let Some(flag) = iter.peek() {
            if !flag.starts_with('-') {
                break;
            }
            let takes_value = matches!(flag.as_str(), "-u" | "-g" | "-h" | "-p" | "-C");
            iter.next();
            if takes_value {
                iter.next();
            }
        }
    }

    Some(iter.collect())
}

fn is_assignment(word: &str) -> bool {
    word.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit())
    })
}

fn basename(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(program)
}

fn words_are_write(words: &[String]) -> bool {
    let Some((program, args)) = words.split_first() else {
        return true;
    };
    let program = basename(program);

    match program {
        "sed" => args.iter().any(|a| is_in_place_flag(a)),
        "git" => git_is_write(args),
        "find" => args.iter().any(|a| {
            FIND_ACTION_PREDICATES.contains(&a.as_str()) || a.starts_with("-fprint")
        }),
        "sort" => args
            .iter()
            .any(|a| a == "-o" || a.starts_with("--output") || short_cluster_has(a, 'o')),
        _ if WRITE_BINARIES.contains(&program) => true,
        _ if READ_BINARIES.contains(&program) => false,
        _ => true,
    }
}

fn is_in_place_flag(arg: &str) -> bool {
    arg.starts_with("--in-place") || arg.starts_with("-i") || short_cluster_has(arg, 'i')
}

/// `-ni` style clusters of single-letter flags.
fn short_cluster_has(arg: &str, flag: char) -> bool {
    arg.len() > 1
        && arg.starts_with('-')
        && !arg.starts_with("--")
        && arg[1..].chars().all(|c| c.is_ascii_alphabetic())
        && arg[1..].contains(flag)
}

fn git_is_write(args: &[String]) -> bool {
    let mut iter = args.iter();
    let subcommand = loop {
        let Some(arg) = iter.next() else {
            // Bare `git` prints usage.
            return false;
        };
        match arg.as_str() {
            "-C" | "-c" | "--git-dir" | "--work-tree" | "--namespace" => {
                iter.next();
            }
            a if a.starts_with('-') => {}
            a => break a,
        }
    };
    let rest: Vec<&str> = iter.map(String::as_str).collect();

    if GIT_WRITE_SUBCOMMANDS.contains(&subcommand) {
        return true;
    }
    if !GIT_READ_SUBCOMMANDS.contains(&subcommand) {
        return true;
    }

    match subcommand {
        "branch" => rest.iter().any(|a| {
            matches!(
                *a,
                "-d" | "-D"
                    | "--delete"
                    | "-m"
                    | "-M"
                    | "--move"
                    | "-c"
                    | "-C"
                    | "--copy"
                    | "--set-upstream-to"
                    | "-u"
                    | "--unset-upstream"
                    | "--edit-description"
            ) || a.starts_with("--set-upstream-to=")
                || short_cluster_has(a, 'd')
                || short_cluster_has(a, 'D')
        }),
        "config" => {
            let scoped = rest.iter().any(|a| matches!(*a, "--global" | "--system"));
            let action = rest.iter().any(|a| {
                matches!(
                    *a,
                    "--unset" | "--unset-all" | "--add" | "--replace-all" | "--edit" | "-e"
                ) || a.starts_with("--rename-section")
                    || a.starts_with("--remove-section")
            });
            let positional = rest.iter().filter(|a| !a.starts_with('-')).count();
            scoped && (action || positional >= 2)
        }
        _ => false,
    }
}

/// A command segment between chain operators, split into pipeline stages.
#[derive(Debug, Default)]
struct Segment {
    stages: Vec<String>,
    redirects: bool,
}

/// Splits on unquoted `;`, `&&`, `||`, `&` and `|`.
///
/// Returns `None` for unbalanced quotes or command substitution, both of
/// which are classified as writes.
fn split_unquoted(command: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut segment = Segment::default();
    let mut stage = String::new();
    let mut chars = command.chars().peekable();
    let mut single = false;
    let mut double = false;

    while let Some(c) = chars.next() {
        if single {
            single = c != '\'';
            stage.push(c);
            continue;
        }
        match c {
            '\\' => {
                stage.push(c);
                if let Some(next) = chars.next() {
                    stage.push(next);
                }
            }
            '\'' if !double => {
                single = true;
                stage.push(c);
            }
            '"' => {
                double = !double;
                stage.push(c);
            }
            '`' => return None,
            '$' if chars.peek() == Some(&'(') => return None,
            _ if double => stage.push(c),
            '>' => {
                segment.redirects = true;
                stage.push(c);
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                segment.stages.push(std::mem::take(&mut stage));
                segments.push(std::mem::take(&mut segment));
            }
            '|' => segment.stages.push(std::mem::take(&mut stage)),
            ';' | '\n' => {
                segment.stages.push(std::mem::take(&mut stage));
                segments.push(std::mem::take(&mut segment));
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                segment.stages.push(std::mem::take(&mut stage));
                segments.push(std::mem::take(&mut segment));
            }
            '&' if chars.peek() == Some(&'>') => {
                segment.redirects = true;
                stage.push(c);
            }
            '&' if stage.ends_with('>') => stage.push(c),
            '&' => {
                segment.stages.push(std::mem::take(&mut stage));
                segments.push(std::mem::take(&mut segment));
            }
            _ => stage.push(c),
        }
    }

    if single || double {
        return None;
    }
    segment.stages.push(stage);
    segments.push(segment);

    // Trailing separators (`ls;`, `sleep 1 &`) leave empty segments behind.
    segments.retain(|s| !s.stages.iter().all(|st| st.trim().is_empty()) || s.redirects);
    if segments.is_empty() {
        segments.push(Segment::default());
    }
    Some(segments)
}
