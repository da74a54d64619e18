//! REPL – interactive shell over the memory system.
//!
//! Supported slash-commands:
//!   /say <user> | <agent>    – record a conversation exchange
//!   /event <kind> <text|json> – record an event
//!   /recall <query>          – retrieve related memories
//!   /recent [n]              – newest records
//!   /important               – cached important records
//!   /related <id>            – records linked to `id`
//!   /stats                   – store counters and the last scheduled pass
//!   /consolidate             – run a consolidation pass now
//!   /purge <idle-days> [below <importance>] – delete stale records
//!   /reindex                 – rebuild the semantic index
//!   /help                    – show this list
//!   /quit | /exit            – gracefully exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use keepsake_memory::retrieval::RetrievedMemory;
use keepsake_memory::{ConversationContext, MemorySystem, PurgeCriteria};
use keepsake_runtime::scheduler::LastRun;
use keepsake_types::{Importance, MemoryKind, MemoryRecord, RecordId};
use serde_json::{Map, Value, json};
use tokio::sync::watch;

const DEFAULT_RECALL_LIMIT: usize = 5;
const DEFAULT_RECENT_LIMIT: usize = 10;
const PREVIEW_CHARS: usize = 72;

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say { user: String, agent: String },
    Event { kind: String, payload: Value },
    Recall(String),
    Recent(usize),
    Important,
    Related(RecordId),
    Stats,
    Consolidate,
    Purge { idle_days: i64, below: Option<Importance> },
    Reindex,
    Help,
    Quit,
}

impl Command {
    /// Parse one input line.  The error is a usage hint for the user.
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (line, ""),
        };

        match head {
            "/say" => {
                let (user, agent) = rest
                    .split_once('|')
                    .map(|(u, a)| (u.trim(), a.trim()))
                    .ok_or_else(|| "usage: /say <user message> | <agent reply>".to_string())?;
                if user.is_empty() {
                    return Err("usage: /say <user message> | <agent reply>".to_string());
                }
                Ok(Command::Say {
                    user: user.to_string(),
                    agent: agent.to_string(),
                })
            }
            "/event" => {
                let (kind, body) = rest
                    .split_once(char::is_whitespace)
                    .map(|(k, b)| (k, b.trim()))
                    .unwrap_or((rest, ""));
                if kind.is_empty() || body.is_empty() {
                    return Err("usage: /event <kind> <text or JSON object>".to_string());
                }
                Ok(Command::Event {
                    kind: kind.to_string(),
                    payload: event_payload(body),
                })
            }
            "/recall" if !rest.is_empty() => Ok(Command::Recall(rest.to_string())),
            "/recall" => Err("usage: /recall <query>".to_string()),
            "/recent" if rest.is_empty() => Ok(Command::Recent(DEFAULT_RECENT_LIMIT)),
            "/recent" => rest
                .parse::<usize>()
                .map(Command::Recent)
                .map_err(|_| format!("'{}' is not a number", rest)),
            "/important" => Ok(Command::Important),
            "/related" => rest
                .parse::<RecordId>()
                .map(Command::Related)
                .map_err(|_| "usage: /related <id>".to_string()),
            "/stats" => Ok(Command::Stats),
            "/consolidate" => Ok(Command::Consolidate),
            "/purge" => parse_purge(rest),
            "/reindex" => Ok(Command::Reindex),
            "/help" => Ok(Command::Help),
            "/quit" | "/exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command: '{}'", other)),
        }
    }
}

/// A JSON object is taken as-is; anything else becomes `{"text": ...}`.
fn event_payload(body: &str) -> Value {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => {
            let mut map = Map::new();
            map.insert("text".to_string(), Value::String(body.to_string()));
            Value::Object(map)
        }
    }
}

fn parse_purge(rest: &str) -> Result<Command, String> {
    const USAGE: &str = "usage: /purge <idle-days> [below <importance>]";
    let mut words = rest.split_whitespace();
    let idle_days = words
        .next()
        .and_then(|w| w.parse::<i64>().ok())
        .filter(|d| *d > 0)
        .ok_or_else(|| USAGE.to_string())?;
    let below = match (words.next(), words.next()) {
        (None, _) => None,
        (Some("below"), Some(n)) => Some(Importance::new(n.parse::<i64>().map_err(|_| USAGE.to_string())?)),
        _ => return Err(USAGE.to_string()),
    };
    if words.next().is_some() {
        return Err(USAGE.to_string());
    }
    Ok(Command::Purge { idle_days, below })
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(memory: &MemorySystem, last_run: watch::Receiver<Option<LastRun>>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "keepsake>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => execute(memory, &last_run, cmd),
            Err(msg) => println!("{} Type {} for available commands.", msg.red(), "/help".bold()),
        }
    }
}

fn execute(memory: &MemorySystem, last_run: &watch::Receiver<Option<LastRun>>, cmd: Command) {
    match cmd {
        Command::Say { user, agent } => cmd_say(memory, &user, &agent),
        Command::Event { kind, payload } => cmd_event(memory, &kind, payload),
        Command::Recall(query) => print_retrieved(&memory.retrieve_related(&query, DEFAULT_RECALL_LIMIT)),
        Command::Recent(n) => match memory.recent(n) {
            Ok(records) => print_records("Recent memories", &records),
            Err(e) => println!("{}: {}", "Query failed".red(), e),
        },
        Command::Important => print_records("Important memories", &memory.cached_important()),
        Command::Related(id) => match memory.related_to(id, keepsake_memory::system::DEFAULT_RELATED_LIMIT) {
            Ok(records) => print_records(&format!("Related to #{}", id), &records),
            Err(e) => println!("{}: {}", "Query failed".red(), e),
        },
        Command::Stats => cmd_stats(memory, last_run),
        Command::Consolidate => cmd_consolidate(memory),
        Command::Purge { idle_days, below } => cmd_purge(memory, idle_days, below),
        Command::Reindex => match memory.rebuild_semantic_index() {
            Ok(n) => println!("{} {} record(s) indexed", "✓".green(), n),
            Err(e) => println!("{}: {}", "Reindex failed".red(), e),
        },
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Keepsake Commands".bold().underline());
    println!("  {}  – record an exchange", "/say <user> | <agent>".bold().cyan());
    println!("  {}  – record an event", "/event <kind> <text|json>".bold().cyan());
    println!("  {}  – retrieve related memories", "/recall <query>".bold().cyan());
    println!("  {}  – newest records", "/recent [n]".bold().cyan());
    println!("  {}  – cached important records", "/important".bold().cyan());
    println!("  {}  – linked records", "/related <id>".bold().cyan());
    println!("  {}  – counters and last scheduled pass", "/stats".bold().cyan());
    println!("  {}  – run consolidation now", "/consolidate".bold().cyan());
    println!("  {}  – delete stale records", "/purge <idle-days> [below <n>]".bold().cyan());
    println!("  {}  – rebuild the semantic index", "/reindex".bold().cyan());
    println!("  {}  – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_say(memory: &MemorySystem, user: &str, agent: &str) {
    match memory.record_conversation(user, agent, ConversationContext::default()) {
        Ok(id) => report_saved(memory, id),
        Err(e) => println!("{}: {}", "Write failed".red(), e),
    }
}

fn cmd_event(memory: &MemorySystem, kind: &str, payload: Value) {
    let kind = match MemoryKind::event(kind) {
        Ok(k) => k,
        Err(e) => {
            println!("{}: {}", "Invalid kind".red(), e);
            return;
        }
    };
    match memory.record_event(kind, payload) {
        Ok(id) => report_saved(memory, id),
        Err(e) => println!("{}: {}", "Write failed".red(), e),
    }
}

fn report_saved(memory: &MemorySystem, id: RecordId) {
    match memory.store().get(id) {
        Ok(rec) => println!(
            "{} saved #{} (importance {}, tags: {})",
            "✓".green(),
            id,
            rec.importance.to_string().yellow(),
            if rec.tags.is_empty() { "-".to_string() } else { rec.tags.join(", ") }
        ),
        Err(_) => println!("{} saved #{}", "✓".green(), id),
    }
}

fn cmd_stats(memory: &MemorySystem, last_run: &watch::Receiver<Option<LastRun>>) {
    match memory.stats() {
        Ok(stats) => {
            println!("{}", "Memory Statistics".bold().underline());
            println!("  Records            : {}", stats.store.total_records.to_string().bold());
            for (kind, count) in &stats.store.by_kind {
                println!("    {:<16} {}", kind, count);
            }
            println!("  Average importance : {:.2}", stats.store.average_importance);
            println!("  Relations          : {}", stats.store.relations);
            println!(
                "  Cache              : {} recent, {} important",
                stats.cached_recent, stats.cached_important
            );
            println!(
                "  Semantic index     : {}",
                if stats.semantic_index { "on".green() } else { "off".dimmed() }
            );
        }
        Err(e) => println!("{}: {}", "Stats failed".red(), e),
    }
    match last_run.borrow().as_ref() {
        Some(last) => println!(
            "  Last scheduled pass: {} ({} expired, {} reinforced, {} decayed)",
            last.at.format("%Y-%m-%d %H:%M:%S UTC"),
            last.report.expired_removed,
            last.report.reinforced,
            last.report.decayed
        ),
        None => println!("  Last scheduled pass: {}", "none yet".dimmed()),
    }
}

fn cmd_consolidate(memory: &MemorySystem) {
    match memory.run_consolidation() {
        Some(report) => {
            println!(
                "{} {} expired, {} reinforced, {} decayed",
                "✓".green(),
                report.expired_removed,
                report.reinforced,
                report.decayed
            );
            for (step, reason) in &report.failures {
                println!("  {} {}: {}", "✗".red(), step, reason);
            }
        }
        None => println!("{}", "A consolidation pass is already running.".yellow()),
    }
}

fn cmd_purge(memory: &MemorySystem, idle_days: i64, below: Option<Importance>) {
    let criteria = PurgeCriteria {
        idle_for: Some(chrono::Duration::days(idle_days)),
        importance_below: below,
        ..PurgeCriteria::default()
    };
    match memory.purge_stale(&criteria) {
        Ok(n) => println!("{} {} record(s) removed", "✓".green(), n),
        Err(e) => println!("{}: {}", "Purge failed".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_retrieved(hits: &[RetrievedMemory]) {
    if hits.is_empty() {
        println!("  {}", "nothing related".dimmed());
        return;
    }
    for hit in hits {
        let source = json!(hit.source);
        println!("  {} [{}]", record_line(&hit.record), source.as_str().unwrap_or("?").dimmed());
    }
}

fn print_records(title: &str, records: &[MemoryRecord]) {
    println!("{}", title.bold().underline());
    if records.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for rec in records {
        println!("  {}", record_line(rec));
    }
}

fn record_line(rec: &MemoryRecord) -> String {
    format!(
        "#{:<5} {:>3} {:<14} {}",
        rec.id,
        rec.importance.value(),
        rec.kind.label(),
        preview(&rec.content.text())
    )
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(PREVIEW_CHARS - 1).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_say_with_separator() {
        assert_eq!(
            Command::parse("/say I got the job! | Congratulations!").unwrap(),
            Command::Say {
                user: "I got the job!".into(),
                agent: "Congratulations!".into()
            }
        );
        assert!(Command::parse("/say no separator").is_err());
        assert!(Command::parse("/say | only agent").is_err());
    }

    #[test]
    fn event_body_is_json_object_or_text() {
        let cmd = Command::parse(r#"/event milestone {"what":"first hike","importance":90}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Event {
                kind: "milestone".into(),
                payload: json!({ "what": "first hike", "importance": 90 })
            }
        );
        let cmd = Command::parse("/event note bought new plants").unwrap();
        assert_eq!(
            cmd,
            Command::Event {
                kind: "note".into(),
                payload: json!({ "text": "bought new plants" })
            }
        );
        assert!(Command::parse("/event note").is_err());
    }

    #[test]
    fn recent_takes_optional_count() {
        assert_eq!(Command::parse("/recent").unwrap(), Command::Recent(DEFAULT_RECENT_LIMIT));
        assert_eq!(Command::parse("/recent 3").unwrap(), Command::Recent(3));
        assert!(Command::parse("/recent lots").is_err());
    }

    #[test]
    fn purge_arguments() {
        assert_eq!(
            Command::parse("/purge 30").unwrap(),
            Command::Purge { idle_days: 30, below: None }
        );
        assert_eq!(
            Command::parse("/purge 30 below 25").unwrap(),
            Command::Purge {
                idle_days: 30,
                below: Some(Importance::new(25))
            }
        );
        assert!(Command::parse("/purge").is_err());
        assert!(Command::parse("/purge 0").is_err());
        assert!(Command::parse("/purge 30 above 25").is_err());
    }

    #[test]
    fn simple_commands_and_unknowns() {
        assert_eq!(Command::parse("  /stats ").unwrap(), Command::Stats);
        assert_eq!(Command::parse("/exit").unwrap(), Command::Quit);
        assert_eq!(Command::parse("/related 12").unwrap(), Command::Related(12));
        assert!(Command::parse("/related twelve").is_err());
        assert!(Command::parse("/recall").is_err());
        assert!(Command::parse("/dance").is_err());
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "记".repeat(100);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS);
        assert!(p.ends_with('…'));
    }

    #[test]
    fn execute_records_and_recalls() {
        let memory = MemorySystem::open_in_memory(None).unwrap();
        let (_tx, rx) = watch::channel(None);
        execute(&memory, &rx, Command::parse("/event note watered the tomatoes").unwrap());
        execute(&memory, &rx, Command::parse("/say the tomatoes are ripe | lovely!").unwrap());
        assert_eq!(memory.stats().unwrap().store.total_records, 2);
        assert_eq!(memory.retrieve_related("tomatoes", 5).len(), 2);
    }
}
