//! Reversible mapping between Matrix user IDs and Mattermost usernames.
//!
//! Mattermost usernames allow `a-z 0-9 . - _`. The encoding keeps lowercase letters, digits
//! and `.`, turns the `:` server separator into `_`, doubles `-`, and writes every other byte
//! as `-` followed by two lowercase hex digits. Each escape starts with `-` and `_` only ever
//! stands for `:`, so decoding is unambiguous.

use thiserror::Error;

pub const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("`{0}` is not a Matrix user ID")]
    InvalidUserId(String),
    #[error("username `{username}` is {len} characters, over the limit of {MAX_USERNAME_LEN}")]
    TooLong { username: String, len: usize },
    #[error("username `{0}` does not carry the ghost prefix")]
    MissingPrefix(String),
    #[error("username `{0}` contains an invalid escape")]
    InvalidEscape(String),
}

pub fn encode_user_id(prefix: &str, matrix_user_id: &str) -> Result<String, EncodingError> {
    let bare = matrix_user_id
        .strip_prefix('@')
        .filter(|rest| rest.contains(':'))
        .ok_or_else(|| EncodingError::InvalidUserId(matrix_user_id.to_string()))?;

    let mut encoded = String::with_capacity(prefix.len() + bare.len() * 2);
    encoded.push_str(prefix);
    for byte in bare.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' => encoded.push(byte as char),
            b':' => encoded.push('_'),
            b'-' => encoded.push_str("--"),
            other => encoded.push_str(&format!("-{other:02x}")),
        }
    }

    let len = encoded.chars().count();
    if len > MAX_USERNAME_LEN {
        return Err(EncodingError::TooLong {
            username: encoded,
            len,
        });
    }
    Ok(encoded)
}

pub fn decode_username(prefix: &str, username: &str) -> Result<String, EncodingError> {
    let body = username
        .strip_prefix(prefix)
        .ok_or_else(|| EncodingError::MissingPrefix(username.to_string()))?;
    let invalid = || EncodingError::InvalidEscape(username.to_string());

    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(b'@');
    let mut input = body.bytes();
    while let Some(byte) = input.next() {
        match byte {
            b'_' => bytes.push(b':'),
            b'-' => match input.next().ok_or_else(invalid)? {
                b'-' => bytes.push(b'-'),
                high => {
                    let low = input.next().ok_or_else(invalid)?;
                    let pair = [high, low];
                    let hex = std::str::from_utf8(&pair).map_err(|_| invalid())?;
                    bytes.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                }
            },
            other => bytes.push(other),
        }
    }

    String::from_utf8(bytes).map_err(|_| invalid())
}

pub fn is_encoded(prefix: &str, username: &str) -> bool {
    username.starts_with(prefix)
}
