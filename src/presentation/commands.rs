//! Console front end: control lines in, event lines out.

use crate::domain::models::ConnectionEvent;
use crate::domain::player::{ControlCommand, Features};
use anyhow::{anyhow, bail, Context};

pub const HELP: &str = "\
commands:
  play | pause           toggle playback
  next | prev            skip
  seek <secs>            relative seek, negative goes back
  volume <0-100>         set volume
  rate <n>               rate the current item
  repeat | shuffle       toggle mode
  fullscreen             toggle fullscreen
  tag <item> <tags...>   tag an item
  action <id> [ids...]   run a player action on items
  item <id>              request an item
  list <page> [path...]  request a list page
  shutdown               shut the player down
  help | quit";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Control(ControlCommand),
    Action { id: i32, targets: Vec<String> },
    Item(String),
    List { path: Vec<String>, page: i32 },
    Help,
    Quit,
}

/// Parse one line; blank lines yield `None`
pub fn parse_line(line: &str) -> anyhow::Result<Option<RemoteCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<String> = words.map(str::to_string).collect();

    let command = match verb.to_lowercase().as_str() {
        "play" | "pause" | "toggle" => RemoteCommand::Control(ControlCommand::PlayPause),
        "next" => RemoteCommand::Control(ControlCommand::Next),
        "prev" | "previous" => RemoteCommand::Control(ControlCommand::Prev),
        "seek" => RemoteCommand::Control(ControlCommand::Seek(number(&rest, 0, "seconds")?)),
        "volume" | "vol" => {
            let volume = number(&rest, 0, "volume")?;
            if !(0..=100).contains(&volume) {
                bail!("volume must be 0-100");
            }
            RemoteCommand::Control(ControlCommand::Volume(volume))
        }
        "rate" => RemoteCommand::Control(ControlCommand::Rate(number(&rest, 0, "rating")?)),
        "repeat" => RemoteCommand::Control(ControlCommand::ToggleRepeat),
        "shuffle" => RemoteCommand::Control(ControlCommand::ToggleShuffle),
        "fullscreen" => RemoteCommand::Control(ControlCommand::ToggleFullscreen),
        "tag" => {
            let item_id = rest.first().cloned().ok_or_else(|| anyhow!("missing item id"))?;
            RemoteCommand::Control(ControlCommand::Tag {
                item_id,
                tags: rest[1..].join(","),
            })
        }
        "shutdown" => RemoteCommand::Control(ControlCommand::Shutdown),
        "action" => RemoteCommand::Action {
            id: number(&rest, 0, "action id")?,
            targets: rest[1..].to_vec(),
        },
        "item" => RemoteCommand::Item(
            rest.first()
                .cloned()
                .ok_or_else(|| anyhow!("missing item id"))?,
        ),
        "list" => RemoteCommand::List {
            page: number(&rest, 0, "page")?,
            path: rest[1..].to_vec(),
        },
        "help" | "?" => RemoteCommand::Help,
        "quit" | "exit" => RemoteCommand::Quit,
        other => bail!("unknown command '{}', try 'help'", other),
    };
    Ok(Some(command))
}

fn number(args: &[String], index: usize, what: &str) -> anyhow::Result<i32> {
    let raw = args.get(index).ok_or_else(|| anyhow!("missing {}", what))?;
    raw.parse()
        .with_context(|| format!("invalid {} '{}'", what, raw))
}

/// One line describing an event for the console
pub fn describe(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::StateChanged(state) => format!("[{}]", state),
        ConnectionEvent::PlayerInfo(info) => {
            let mut line = format!("player: {}", info.name);
            if info.supports(Features::CTL_RATE) && info.max_rating > 0 {
                line.push_str(&format!(" (rating 0-{})", info.max_rating));
            }
            if info.supports_media_browser() {
                line.push_str(" [browser]");
            }
            line
        }
        ConnectionEvent::StateSync(state) => format!(
            "{:?}, volume {}%, repeat {}, shuffle {}, {} position {}",
            state.playback,
            state.volume,
            on_off(state.repeat),
            on_off(state.shuffle),
            if state.queue { "queue" } else { "playlist" },
            state.position
        ),
        ConnectionEvent::ItemSync(item) if item.is_none() => "nothing playing".to_string(),
        ConnectionEvent::ItemSync(item) => format!(
            "now playing: {} - {}",
            item.artist().unwrap_or("?"),
            item.title().unwrap_or(&item.id)
        ),
        ConnectionEvent::RequestedItem(item) => {
            format!("item {}: {}", item.id, item.title().unwrap_or("?"))
        }
        ConnectionEvent::ItemList(list) => {
            let mut out = format!(
                "/{} (page {}/{})",
                list.path.join("/"),
                list.page + 1,
                list.page_count.max(1)
            );
            for nested in &list.nested {
                out.push_str(&format!("\n  {}/", nested));
            }
            for (id, name) in list.item_ids.iter().zip(&list.item_names) {
                out.push_str(&format!("\n  {} [{}]", name, id));
            }
            out
        }
        ConnectionEvent::ServerShutdown => "server shut down".to_string(),
        ConnectionEvent::Error(e) => format!("error: {}", e),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
