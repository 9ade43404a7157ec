//! Upgrade-URL query parsing and sanitization.
//!
//! The only input surface before authentication is the query string of
//! the upgrade request: `/?room=<code>&clientId=<id>&token=<bearer>`.

const MAX_ROOM_LEN: usize = 64;
const MAX_CLIENT_ID_LEN: usize = 128;

/// Validated parameters extracted from the upgrade URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinQuery {
    /// Room code, trimmed and uppercased.
    pub room: String,
    /// Client id, trimmed.
    pub client_id: String,
    /// Opaque bearer token, passed to the verifier untouched.
    pub token: String,
}

/// Printable ASCII with no whitespace. Control characters, spaces, and
/// anything outside the 7-bit range are rejected.
fn is_clean(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x21..=0x7e).contains(&b))
}

fn sanitize_room_code(raw: &str) -> Option<String> {
    let room = raw.trim();
    if room.len() > MAX_ROOM_LEN || !is_clean(room) {
        return None;
    }
    Some(room.to_ascii_uppercase())
}

fn sanitize_client_id(raw: &str) -> Option<String> {
    let client_id = raw.trim();
    if client_id.len() > MAX_CLIENT_ID_LEN || !is_clean(client_id) {
        return None;
    }
    Some(client_id.to_string())
}

/// Parse the raw query string of an upgrade request.
///
/// Returns a human-readable reason on rejection; the caller maps every
/// failure to a single `bad_request` envelope so the reason is for logs
/// and the client message only.
pub fn parse_join_query(query: &str) -> Result<JoinQuery, &'static str> {
    let mut room = None;
    let mut client_id = None;
    let mut token = None;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "room" => room = Some(value.into_owned()),
            "clientId" => client_id = Some(value.into_owned()),
            "token" => token = Some(value.into_owned()),
            _ => {}
        }
    }

    let room = room
        .as_deref()
        .and_then(sanitize_room_code)
        .ok_or("missing or malformed room")?;
    let client_id = client_id
        .as_deref()
        .and_then(sanitize_client_id)
        .ok_or("missing or malformed clientId")?;
    let token = token.filter(|t| !t.is_empty()).ok_or("missing token")?;

    Ok(JoinQuery {
        room,
        client_id,
        token,
    })
}
