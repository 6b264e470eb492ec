use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Quién pidió el track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    pub username: String,
}

impl Requester {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duración en milisegundos
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Track tal como lo devuelve el nodo (`encoded` + metadatos)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    #[serde(default)]
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plugin_info: Value,
    #[serde(skip)]
    pub requester: Option<Requester>,
}

impl Track {
    pub fn with_requester(mut self, requester: Option<Requester>) -> Self {
        self.requester = requester;
        self
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn uri(&self) -> Option<&str> {
        self.info.uri.as_deref()
    }

    /// Limita una posición a la duración del track
    pub fn clamp_position(&self, position: u64) -> u64 {
        if self.info.length == 0 || self.info.is_stream {
            position
        } else {
            position.min(self.info.length)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaylistInfo {
    pub name: String,
    pub selected_track: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(default)]
    pub info: PlaylistInfo,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: String,
}

/// Resultado de `/v4/loadtracks`
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Track(Track),
    Playlist(Playlist),
    Search(Vec<Track>),
    Empty,
    Error(TrackException),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: String,
    #[serde(default)]
    data: Value,
}

impl LoadResult {
    /// Interpreta la respuesta cruda `{loadType, data}`
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let raw: RawLoadResult = serde_json::from_value(value)?;
        Ok(match raw.load_type.as_str() {
            "track" => Self::Track(serde_json::from_value(raw.data)?),
            "playlist" => Self::Playlist(serde_json::from_value(raw.data)?),
            "search" => Self::Search(serde_json::from_value(raw.data)?),
            "error" => Self::Error(serde_json::from_value(raw.data)?),
            _ => Self::Empty,
        })
    }

    pub fn tracks(&self) -> &[Track] {
        match self {
            Self::Track(track) => std::slice::from_ref(track),
            Self::Playlist(playlist) => &playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty | Self::Error(_) => &[],
        }
    }

    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![track],
            Self::Playlist(playlist) => playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty | Self::Error(_) => Vec::new(),
        }
    }

    pub(crate) fn attach_requester(&mut self, requester: &Option<Requester>) {
        let tracks: &mut [Track] = match self {
            Self::Track(track) => std::slice::from_mut(track),
            Self::Playlist(playlist) => &mut playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty | Self::Error(_) => &mut [],
        };
        for track in tracks {
            track.requester = requester.clone();
        }
    }
}

#[cfg(test)]
pub(crate) fn test_track(id: &str, length: u64) -> Track {
    Track {
        encoded: format!("QAAA{id}"),
        info: TrackInfo {
            identifier: id.to_string(),
            is_seekable: true,
            author: "Artist".to_string(),
            length,
            title: format!("Song {id}"),
            uri: Some(format!("https://example.com/{id}")),
            source_name: "http".to_string(),
            ..Default::default()
        },
        plugin_info: Value::Null,
        requester: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_load_result_search() {
        let value = json!({
            "loadType": "search",
            "data": [{
                "encoded": "QAAAjQIAJVJpY2sgQXN0bGV5",
                "info": {
                    "identifier": "dQw4w9WgXcQ",
                    "isSeekable": true,
                    "author": "RickAstleyVEVO",
                    "length": 212000,
                    "isStream": false,
                    "position": 0,
                    "title": "Never Gonna Give You Up",
                    "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                    "sourceName": "youtube"
                },
                "pluginInfo": {}
            }]
        });

        let result = LoadResult::from_value(value).unwrap();
        assert_eq!(result.tracks().len(), 1);
        assert_eq!(result.tracks()[0].info.length, 212000);
        assert_eq!(result.tracks()[0].title(), "Never Gonna Give You Up");
    }

    #[test]
    fn test_load_result_empty_and_unknown() {
        let empty = LoadResult::from_value(json!({"loadType": "empty", "data": {}})).unwrap();
        assert_eq!(empty, LoadResult::Empty);

        let error = LoadResult::from_value(json!({
            "loadType": "error",
            "data": {"message": "boom", "severity": "common", "cause": "x"}
        }))
        .unwrap();
        assert!(error.tracks().is_empty());
    }

    #[test]
    fn test_attach_requester() {
        let mut result = LoadResult::Search(vec![test_track("a", 1000), test_track("b", 1000)]);
        result.attach_requester(&Some(Requester::new("42", "ana")));
        assert!(result
            .tracks()
            .iter()
            .all(|t| t.requester.as_ref().map(|r| r.username.as_str()) == Some("ana")));
    }

    #[test]
    fn test_clamp_position() {
        let track = test_track("a", 5000);
        assert_eq!(track.clamp_position(9000), 5000);
        assert_eq!(track.clamp_position(1000), 1000);
    }
}
