//! Static token dictionaries shared with the server, used to shrink common tag/attribute
//! names and JID server strings to one or two bytes on the wire.

const fn build_single_byte_tokens() -> [&'static str; 256] {
    let mut tokens = [""; 256];
    tokens[1] = "message";
    tokens[2] = "body";
    tokens[3] = "to";
    tokens[4] = "from";
    tokens[5] = "type";
    tokens[6] = "text";
    tokens[7] = "chat";
    tokens[8] = "participant";
    tokens[9] = "conversation";
    tokens[10] = "metadata";
    tokens[11] = "item";
    tokens[12] = "id";
    tokens[13] = "iq";
    tokens[14] = "get";
    tokens[15] = "set";
    tokens[16] = "result";
    tokens[17] = "error";
    tokens[18] = "receipt";
    tokens[19] = "ack";
    tokens[20] = "presence";
    tokens[21] = "notification";
    tokens[22] = "enc";
    tokens[23] = "v";
    tokens[24] = "pkmsg";
    tokens[25] = "msg";
    tokens[26] = "skmsg";
    tokens[27] = "stream:error";
    tokens[28] = "stream:features";
    tokens[29] = "success";
    tokens[30] = "failure";
    tokens[31] = "pair-device";
    tokens[32] = "pair-success";
    tokens[33] = "device";
    tokens[34] = "key-index";
    tokens[35] = "user";
    tokens[36] = "group";
    tokens[37] = "contact";
    tokens[38] = "config";
    tokens[39] = "retry";
    tokens[40] = "count";
    tokens[41] = "reason";
    tokens[42] = "code";
    tokens[43] = "unavailable";
    tokens[44] = "available";
    tokens[45] = "composing";
    tokens[46] = "paused";
    tokens[47] = "timestamp";
    tokens[48] = "notify";
    tokens[49] = "verified_name";
    tokens[50] = "media";
    tokens
}

/// Token dictionary used for compact single-byte symbol encoding.
pub const SINGLE_BYTE_TOKENS: [&str; 256] = build_single_byte_tokens();

const fn build_double_byte_tokens() -> [&'static str; 512] {
    let mut tokens = [""; 512];
    tokens[1] = "ephemeral";
    tokens[2] = "disappearing_mode";
    tokens[3] = "device-list";
    tokens[4] = "identity";
    tokens[5] = "registration";
    tokens[6] = "skey";
    tokens[7] = "prekey";
    tokens[8] = "bundle";
    tokens[9] = "sender-key-distribution-message";
    tokens[10] = "platform";
    tokens[11] = "business_name";
    tokens[12] = "account_signature";
    tokens[13] = "history_sync";
    tokens[14] = "app_state";
    tokens[15] = "read-receipt";
    tokens[16] = "played";
    tokens
}

/// Token dictionary for the rarer, two-byte-indexed symbol family.
pub const DOUBLE_BYTE_TOKENS: [&str; 512] = build_double_byte_tokens();

/// Server hostnames keyed by a single byte, used inside the packed JID symbol encoding.
pub const JID_SERVER_TOKENS: [&str; 6] = [
    "s.whatsapp.net",
    "g.us",
    "broadcast",
    "newsletter",
    "lid",
    "call",
];

pub fn single_byte_token_for(symbol: &str) -> Option<u8> {
    SINGLE_BYTE_TOKENS
        .iter()
        .position(|token| *token == symbol)
        .and_then(|index| u8::try_from(index).ok())
}

pub fn double_byte_token_for(symbol: &str) -> Option<u16> {
    DOUBLE_BYTE_TOKENS
        .iter()
        .position(|token| *token == symbol)
        .and_then(|index| u16::try_from(index).ok())
}

pub fn jid_server_token_for(server: &str) -> Option<u8> {
    JID_SERVER_TOKENS
        .iter()
        .position(|token| *token == server)
        .and_then(|index| u8::try_from(index).ok())
}

/// True if `s` is composed solely of digits, `+`, or `-`: the shape the nibble-packed
/// numeric encoding targets (phone-number-like user parts).
pub fn is_nibble_packable(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || c == '+' || c == '-')
}

/// Maps a nibble-packable character to its 4-bit code; `0xF` is the odd-length filler.
pub fn nibble_for_char(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        '-' => Some(10),
        '+' => Some(11),
        _ => None,
    }
}

pub fn char_for_nibble(n: u8) -> Option<char> {
    match n {
        0..=9 => Some((b'0' + n) as char),
        10 => Some('-'),
        11 => Some('+'),
        _ => None,
    }
}

pub const NIBBLE_FILLER: u8 = 0xF;
