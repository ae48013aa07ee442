//! Player-side values exchanged with the server and their atom layouts.

use crate::error::{Error, Result};
use crate::infrastructure::comm::atom::{Atom, AtomBuffer, AtomKind, Serializable};
use bitflags::bitflags;

bitflags! {
    /// Capabilities a player announces in its player info
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Features: u32 {
        const KNOWN_VOLUME = 1 << 0;
        const KNOWN_REPEAT = 1 << 1;
        const KNOWN_SHUFFLE = 1 << 2;
        const KNOWN_PLAYBACK = 1 << 3;
        const KNOWN_PROGRESS = 1 << 4;

        const CTL_PLAYBACK = 1 << 9;
        const CTL_VOLUME = 1 << 10;
        const CTL_REPEAT = 1 << 11;
        const CTL_SHUFFLE = 1 << 12;
        const CTL_RATE = 1 << 13;
        const CTL_TAG = 1 << 14;
        const CTL_SEEK = 1 << 15;
        const CTL_NEXT = 1 << 16;
        const CTL_PREV = 1 << 17;
        const CTL_FULLSCREEN = 1 << 18;

        const REQ_ITEM = 1 << 20;
        const REQ_PLAYLIST = 1 << 21;
        const REQ_QUEUE = 1 << 22;
        const REQ_MLIB = 1 << 23;

        const SHUTDOWN = 1 << 25;
    }
}

/// An action the player offers on files or items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAction {
    pub id: i32,
    pub label: String,
    /// Applies to several targets at once
    pub multiple: bool,
    pub help: String,
}

/// Descriptive information about the player, sent once after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub name: String,
    pub features: Features,
    pub max_rating: u8,
    pub file_actions: Vec<ItemAction>,
    pub search_mask: Vec<String>,
}

impl Default for PlayerInfo {
    fn default() -> Self {
        Self {
            name: "Player".to_string(),
            features: Features::empty(),
            max_rating: 0,
            file_actions: Vec::new(),
            search_mask: Vec::new(),
        }
    }
}

impl PlayerInfo {
    pub fn supports(&self, feature: Features) -> bool {
        self.features.intersects(feature)
    }

    /// Whether there is anything to browse on the player
    pub fn supports_media_browser(&self) -> bool {
        self.supports(Features::REQ_PLAYLIST | Features::REQ_QUEUE | Features::REQ_MLIB)
            || !self.file_actions.is_empty()
    }
}

impl Serializable for PlayerInfo {
    const FORMAT: &'static [AtomKind] = &[
        AtomKind::String,
        AtomKind::Int32,
        AtomKind::Byte,
        AtomKind::Int32Array,
        AtomKind::StringArray,
        AtomKind::BoolArray,
        AtomKind::StringArray,
        AtomKind::StringArray,
    ];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        let actions = &self.file_actions;
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![
                Atom::String(self.name.clone()),
                Atom::Int32(self.features.bits() as i32),
                Atom::Byte(self.max_rating),
                Atom::Int32Array(actions.iter().map(|a| a.id).collect()),
                Atom::StringArray(actions.iter().map(|a| a.label.clone()).collect()),
                Atom::BoolArray(actions.iter().map(|a| a.multiple).collect()),
                Atom::StringArray(actions.iter().map(|a| a.help.clone()).collect()),
                Atom::StringArray(self.search_mask.clone()),
            ],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        let name = cursor.string()?;
        let features = Features::from_bits_retain(cursor.int32()? as u32);
        let max_rating = cursor.byte()?;

        let ids = cursor.int32_array()?;
        let labels = cursor.string_array()?;
        let multiple = cursor.bool_array()?;
        let help = cursor.string_array()?;
        if labels.len() != ids.len() || multiple.len() != ids.len() || help.len() != ids.len() {
            return Err(Error::malformed(format!(
                "file action columns differ in length ({}, {}, {}, {})",
                ids.len(),
                labels.len(),
                multiple.len(),
                help.len()
            )));
        }
        let file_actions = ids
            .into_iter()
            .zip(labels)
            .zip(multiple)
            .zip(help)
            .map(|(((id, label), multiple), help)| ItemAction {
                id,
                label,
                multiple,
                help,
            })
            .collect();

        let search_mask = cursor.string_array()?;

        Ok(Self {
            name,
            features,
            max_rating,
            file_actions,
            search_mask,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Playback {
    #[default]
    Stop,
    Pause,
    Play,
}

impl Playback {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Stop),
            1 => Ok(Self::Pause),
            2 => Ok(Self::Play),
            other => Err(Error::malformed(format!("unknown playback state {}", other))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Pause => 1,
            Self::Play => 2,
        }
    }
}

/// Player state pushed by the server whenever it changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerState {
    pub playback: Playback,
    /// Volume in percent
    pub volume: u8,
    pub repeat: bool,
    pub shuffle: bool,
    /// Position of the current item in the playlist (or queue)
    pub position: i32,
    /// Whether `position` refers to the queue
    pub queue: bool,
}

impl Serializable for PlayerState {
    const FORMAT: &'static [AtomKind] = &[
        AtomKind::Byte,
        AtomKind::Byte,
        AtomKind::Byte,
        AtomKind::Byte,
        AtomKind::Int32,
        AtomKind::Byte,
    ];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![
                Atom::Byte(self.playback.to_byte()),
                Atom::Byte(self.volume),
                Atom::Byte(u8::from(self.repeat)),
                Atom::Byte(u8::from(self.shuffle)),
                Atom::Int32(self.position),
                Atom::Byte(u8::from(self.queue)),
            ],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        let playback = Playback::from_byte(cursor.byte()?)?;
        let volume = cursor.byte()?;
        if volume > 100 {
            return Err(Error::malformed(format!("volume {} out of range", volume)));
        }
        Ok(Self {
            playback,
            volume,
            repeat: cursor.byte()? != 0,
            shuffle: cursor.byte()? != 0,
            position: cursor.int32()?,
            queue: cursor.byte()? != 0,
        })
    }
}

pub const META_TITLE: &str = "title";
pub const META_ARTIST: &str = "artist";
pub const META_ALBUM: &str = "album";

/// A media item (the one currently playing, or one that was requested)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub id: String,
    /// Ordered metadata pairs
    pub meta: Vec<(String, String)>,
    pub rating: u8,
    /// Encoded cover images, usually zero or one
    pub images: Vec<Vec<u8>>,
}

impl Item {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn title(&self) -> Option<&str> {
        self.meta(META_TITLE)
    }

    pub fn artist(&self) -> Option<&str> {
        self.meta(META_ARTIST)
    }

    /// The server sends an empty id when nothing is playing
    pub fn is_none(&self) -> bool {
        self.id.is_empty()
    }
}

impl Serializable for Item {
    const FORMAT: &'static [AtomKind] = &[
        AtomKind::String,
        AtomKind::StringArray,
        AtomKind::Byte,
        AtomKind::ByteArrayArray,
    ];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![
                Atom::String(self.id.clone()),
                Atom::StringArray(flatten_pairs(&self.meta)),
                Atom::Byte(self.rating),
                Atom::ByteArrayArray(self.images.clone()),
            ],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        Ok(Self {
            id: cursor.string()?,
            meta: pair_up(cursor.string_array()?)?,
            rating: cursor.byte()?,
            images: cursor.byte_array_array()?,
        })
    }
}

/// One page of a browsable list (playlist, queue, library folder)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemList {
    pub path: Vec<String>,
    /// Names of nested lists
    pub nested: Vec<String>,
    pub item_ids: Vec<String>,
    pub item_names: Vec<String>,
    pub page: i32,
    pub page_count: i32,
}

impl Serializable for ItemList {
    const FORMAT: &'static [AtomKind] = &[
        AtomKind::StringArray,
        AtomKind::StringArray,
        AtomKind::StringArray,
        AtomKind::StringArray,
        AtomKind::Int32,
        AtomKind::Int32,
    ];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![
                Atom::StringArray(self.path.clone()),
                Atom::StringArray(self.nested.clone()),
                Atom::StringArray(self.item_ids.clone()),
                Atom::StringArray(self.item_names.clone()),
                Atom::Int32(self.page),
                Atom::Int32(self.page_count),
            ],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        let list = Self {
            path: cursor.string_array()?,
            nested: cursor.string_array()?,
            item_ids: cursor.string_array()?,
            item_names: cursor.string_array()?,
            page: cursor.int32()?,
            page_count: cursor.int32()?,
        };
        if list.item_ids.len() != list.item_names.len() {
            return Err(Error::malformed(format!(
                "{} item ids but {} item names",
                list.item_ids.len(),
                list.item_names.len()
            )));
        }
        Ok(list)
    }
}

/// Client description sent as the first message of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub image_width: i32,
    pub image_height: i32,
    /// Number of list entries per page
    pub page_size: i32,
    pub device: Vec<(String, String)>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            image_width: 120,
            image_height: 120,
            page_size: 50,
            device: vec![(
                "client".to_string(),
                format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            )],
        }
    }
}

impl Serializable for ClientInfo {
    const FORMAT: &'static [AtomKind] = &[
        AtomKind::Int32,
        AtomKind::Int32,
        AtomKind::Int32,
        AtomKind::StringArray,
    ];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![
                Atom::Int32(self.image_width),
                Atom::Int32(self.image_height),
                Atom::Int32(self.page_size),
                Atom::StringArray(flatten_pairs(&self.device)),
            ],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        Ok(Self {
            image_width: cursor.int32()?,
            image_height: cursor.int32()?,
            page_size: cursor.int32()?,
            device: pair_up(cursor.string_array()?)?,
        })
    }
}

/// Control codes understood by servers
pub mod control_code {
    pub const PLAY_PAUSE: i32 = 300;
    pub const NEXT: i32 = 301;
    pub const PREV: i32 = 302;
    pub const SEEK: i32 = 303;
    pub const VOLUME: i32 = 304;
    pub const REPEAT: i32 = 305;
    pub const SHUFFLE: i32 = 306;
    pub const FULLSCREEN: i32 = 307;
    pub const RATE: i32 = 308;
    pub const TAG: i32 = 330;
    pub const SHUTDOWN: i32 = 390;

    pub const ACTION_FILES: i32 = 403;
}

/// Player control commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    PlayPause,
    Next,
    Prev,
    /// Seek forward (positive) or backward (negative), in seconds
    Seek(i32),
    /// Absolute volume in percent
    Volume(i32),
    ToggleRepeat,
    ToggleShuffle,
    ToggleFullscreen,
    Rate(i32),
    Tag { item_id: String, tags: String },
    /// Ask the player to shut down
    Shutdown,
}

/// Wire form of a control or action message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Control {
    pub code: i32,
    pub param: i32,
    pub targets: Vec<String>,
}

impl Control {
    /// Run a player action on a set of targets
    pub fn action(action_id: i32, targets: Vec<String>) -> Self {
        Self {
            code: control_code::ACTION_FILES,
            param: action_id,
            targets,
        }
    }
}

impl From<ControlCommand> for Control {
    fn from(cmd: ControlCommand) -> Self {
        use control_code::*;
        let (code, param, targets) = match cmd {
            ControlCommand::PlayPause => (PLAY_PAUSE, 0, Vec::new()),
            ControlCommand::Next => (NEXT, 0, Vec::new()),
            ControlCommand::Prev => (PREV, 0, Vec::new()),
            ControlCommand::Seek(secs) => (SEEK, secs, Vec::new()),
            ControlCommand::Volume(v) => (VOLUME, v, Vec::new()),
            ControlCommand::ToggleRepeat => (REPEAT, 0, Vec::new()),
            ControlCommand::ToggleShuffle => (SHUFFLE, 0, Vec::new()),
            ControlCommand::ToggleFullscreen => (FULLSCREEN, 0, Vec::new()),
            ControlCommand::Rate(r) => (RATE, r, Vec::new()),
            ControlCommand::Tag { item_id, tags } => (TAG, 0, vec![item_id, tags]),
            ControlCommand::Shutdown => (SHUTDOWN, 0, Vec::new()),
        };
        Self {
            code,
            param,
            targets,
        }
    }
}

impl Serializable for Control {
    const FORMAT: &'static [AtomKind] = &[AtomKind::Int32, AtomKind::Int32, AtomKind::StringArray];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![
                Atom::Int32(self.code),
                Atom::Int32(self.param),
                Atom::StringArray(self.targets.clone()),
            ],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        Ok(Self {
            code: cursor.int32()?,
            param: cursor.int32()?,
            targets: cursor.string_array()?,
        })
    }
}

/// Request for a single item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRequest {
    pub id: String,
}

impl Serializable for ItemRequest {
    const FORMAT: &'static [AtomKind] = &[AtomKind::String];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(Self::FORMAT, vec![Atom::String(self.id.clone())])
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        Ok(Self {
            id: atoms.into_cursor().string()?,
        })
    }
}

/// Request for one page of a list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub path: Vec<String>,
    pub page: i32,
}

impl Serializable for ListRequest {
    const FORMAT: &'static [AtomKind] = &[AtomKind::StringArray, AtomKind::Int32];

    fn to_atoms(&self) -> Result<AtomBuffer> {
        AtomBuffer::from_atoms(
            Self::FORMAT,
            vec![Atom::StringArray(self.path.clone()), Atom::Int32(self.page)],
        )
    }

    fn from_atoms(atoms: AtomBuffer) -> Result<Self> {
        let mut cursor = atoms.into_cursor();
        Ok(Self {
            path: cursor.string_array()?,
            page: cursor.int32()?,
        })
    }
}

fn flatten_pairs(pairs: &[(String, String)]) -> Vec<String> {
    pairs
        .iter()
        .flat_map(|(k, v)| [k.clone(), v.clone()])
        .collect()
}

fn pair_up(flat: Vec<String>) -> Result<Vec<(String, String)>> {
    if flat.len() % 2 != 0 {
        return Err(Error::malformed("odd number of key/value strings"));
    }
    let mut pairs = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::comm::atom::{decode, encode};

    fn sample_info() -> PlayerInfo {
        PlayerInfo {
            name: "Rhythmbox".to_string(),
            features: Features::KNOWN_VOLUME | Features::CTL_NEXT | Features::REQ_MLIB,
            max_rating: 5,
            file_actions: vec![
                ItemAction {
                    id: 1,
                    label: "Enqueue".to_string(),
                    multiple: true,
                    help: "Add to queue".to_string(),
                },
                ItemAction {
                    id: 2,
                    label: "Play".to_string(),
                    multiple: false,
                    help: String::new(),
                },
            ],
            search_mask: vec!["artist".to_string(), "title".to_string()],
        }
    }

    #[test]
    fn test_player_info_round_trip() {
        let info = sample_info();
        let payload = info.to_payload().unwrap();
        assert_eq!(PlayerInfo::from_payload(&payload).unwrap(), info);
    }

    #[test]
    fn test_player_info_action_parity() {
        let mut buffer = decode(&sample_info().to_payload().unwrap(), PlayerInfo::FORMAT).unwrap();
        buffer
            .set(5, Atom::BoolArray(vec![true]))
            .unwrap();
        let payload = encode(&buffer, PlayerInfo::FORMAT).unwrap();
        assert!(matches!(
            PlayerInfo::from_payload(&payload),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_unknown_feature_bits_kept() {
        let mut info = sample_info();
        info.features = Features::from_bits_retain(1 << 30 | 1);
        let decoded = PlayerInfo::from_payload(&info.to_payload().unwrap()).unwrap();
        assert_eq!(decoded.features.bits(), 1 << 30 | 1);
        assert!(decoded.supports(Features::KNOWN_VOLUME));
        assert!(decoded.supports_media_browser());
    }

    #[test]
    fn test_state_rejects_bad_values() {
        let state = PlayerState {
            playback: Playback::Play,
            volume: 80,
            repeat: true,
            shuffle: false,
            position: 3,
            queue: false,
        };
        let payload = state.to_payload().unwrap();
        assert_eq!(payload, vec![2, 80, 1, 0, 0, 0, 0, 3, 0]);
        assert_eq!(PlayerState::from_payload(&payload).unwrap(), state);

        assert!(PlayerState::from_payload(&[3, 80, 1, 0, 0, 0, 0, 3, 0]).is_err());
        assert!(PlayerState::from_payload(&[2, 101, 1, 0, 0, 0, 0, 3, 0]).is_err());
    }

    #[test]
    fn test_item_meta_pairs() {
        let item = Item {
            id: "file:///a.ogg".to_string(),
            meta: vec![
                (META_TITLE.to_string(), "Song".to_string()),
                (META_ARTIST.to_string(), "Band".to_string()),
            ],
            rating: 3,
            images: vec![vec![0x89, b'P', b'N', b'G']],
        };
        let decoded = Item::from_payload(&item.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, item);
        assert_eq!(decoded.title(), Some("Song"));
        assert_eq!(decoded.meta(META_ALBUM), None);
    }

    #[test]
    fn test_item_odd_meta_rejected() {
        let buffer = AtomBuffer::from_atoms(
            Item::FORMAT,
            vec![
                Atom::String("x".into()),
                Atom::StringArray(vec!["title".into()]),
                Atom::Byte(0),
                Atom::ByteArrayArray(vec![]),
            ],
        )
        .unwrap();
        let payload = encode(&buffer, Item::FORMAT).unwrap();
        assert!(Item::from_payload(&payload).is_err());
    }

    #[test]
    fn test_item_list_parity() {
        let list = ItemList {
            path: vec!["Library".into()],
            nested: vec!["Albums".into()],
            item_ids: vec!["1".into(), "2".into()],
            item_names: vec!["One".into()],
            page: 0,
            page_count: 1,
        };
        let payload = list.to_payload().unwrap();
        assert!(ItemList::from_payload(&payload).is_err());
    }

    #[test]
    fn test_control_from_command() {
        let control = Control::from(ControlCommand::Volume(40));
        assert_eq!(control.code, control_code::VOLUME);
        assert_eq!(control.param, 40);
        assert_eq!(
            control.to_payload().unwrap(),
            vec![0, 0, 1, 48, 0, 0, 0, 40, 0, 0]
        );

        let action = Control::action(7, vec!["a".into(), "b".into()]);
        assert_eq!(action.code, control_code::ACTION_FILES);
        assert_eq!(Control::from_payload(&action.to_payload().unwrap()).unwrap(), action);
    }

    #[test]
    fn test_requests_layout() {
        let item = ItemRequest { id: "ab".into() };
        assert_eq!(item.to_payload().unwrap(), vec![0, 2, b'a', b'b']);

        let list = ListRequest {
            path: vec!["Queue".into()],
            page: 2,
        };
        assert_eq!(ListRequest::from_payload(&list.to_payload().unwrap()).unwrap(), list);
    }

    #[test]
    fn test_client_info_round_trip() {
        let info = ClientInfo::default();
        assert_eq!(ClientInfo::from_payload(&info.to_payload().unwrap()).unwrap(), info);
    }
}
