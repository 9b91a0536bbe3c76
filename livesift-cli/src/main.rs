use std::io::IsTerminal;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use zbus::{Connection, proxy, zvariant::Type};

#[derive(Debug, Clone, Type, Serialize, Deserialize)]
struct ResultItem {
    id: String,
    title: String,
    description: String,
    icon: String,
    state: String,
    score: f64,
    highlights: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Type, Serialize, Deserialize)]
struct SearchReply {
    status: String,
    notices: Vec<String>,
    items: Vec<ResultItem>,
}

#[derive(Debug, Clone, Type, Serialize, Deserialize)]
struct ActivateReply {
    ok: bool,
    message: String,
}

#[proxy(
    interface = "org.livesift.Engine1",
    default_service = "org.livesift.Engine",
    default_path = "/org/livesift/Engine1"
)]
trait Engine {
    async fn search(&self, query: &str, discover: bool) -> zbus::Result<SearchReply>;
    async fn activate(&self, id: &str) -> zbus::Result<ActivateReply>;
    async fn sources(&self) -> zbus::Result<Vec<String>>;
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search all sources, or one source by its trigger prefix
    Search {
        /// The search term
        query: String,

        /// Rescan before listing (may take several seconds)
        #[arg(long)]
        discover: bool,

        /// Also print each result's state, score and icon
        #[arg(short, long)]
        verbose: bool,
    },
    /// Activate a result by the id printed by `search`
    Activate { id: String },
    /// List configured sources
    Sources,
}

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Wraps the highlighted character ranges of `title` in bold.
fn emphasize(title: &str, highlights: &[(u32, u32)]) -> String {
    let spans: Vec<_> = highlights.iter().filter(|(start, end)| start < end).collect();
    let mut out = String::with_capacity(title.len());
    for (index, c) in title.chars().enumerate() {
        let index = index as u32;
        if spans.iter().any(|(start, _)| *start == index) {
            out.push_str(BOLD);
        }
        out.push(c);
        if spans.iter().any(|(_, end)| *end == index + 1) {
            out.push_str(RESET);
        }
    }
    out
}

fn render(item: &ResultItem, bold: bool) -> String {
    let title = if bold {
        emphasize(&item.title, &item.highlights)
    } else {
        item.title.clone()
    };
    if item.description.is_empty() {
        format!("- {} [{}]", title, item.id)
    } else {
        format!("- {} ({}) [{}]", title, item.description, item.id)
    }
}

fn details(item: &ResultItem) -> String {
    let mut line = format!("    state: {}, score: {:.2}", item.state, item.score);
    if !item.icon.is_empty() {
        line.push_str(&format!(", icon: {}", item.icon));
    }
    line
}

/// The line printed above the results, or `None` if the search failed.
fn headline(reply: &SearchReply, query: &str) -> Option<String> {
    match reply.status.as_str() {
        "cancelled" => Some(format!("Search for '{query}' was superseded by a newer one")),
        "unavailable" => None,
        _ if reply.items.is_empty() => Some(format!("No results found for '{query}'")),
        _ => Some(format!("Results for '{query}':")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let connection = Connection::session().await?;
    let proxy = EngineProxy::new(&connection).await?;

    match args.command {
        Command::Search {
            query,
            discover,
            verbose,
        } => {
            let reply = proxy.search(&query, discover).await?;
            for notice in &reply.notices {
                eprintln!("Notice: {notice}");
            }

            let Some(headline) = headline(&reply, &query) else {
                bail!("No source could answer '{}'", query);
            };
            println!("{headline}");
            let bold = std::io::stdout().is_terminal();
            for item in &reply.items {
                println!("{}", render(item, bold));
                if verbose {
                    println!("{}", details(item));
                }
            }
        }
        Command::Activate { id } => {
            let reply = proxy.activate(&id).await?;
            if !reply.ok {
                bail!("{}", reply.message);
            }
            println!("Activated {}", reply.message);
        }
        Command::Sources => {
            for name in proxy.sources().await? {
                println!("- {}", name);
            }
        }
    }

    Ok(())
}
