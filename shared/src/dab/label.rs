use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::charset;

/// Length of the FIG 1 label character field.
pub const LABEL_LEN: usize = 16;

/// Maximum encoded length of a FIG 2 extended label.
pub const FIG2_LABEL_MAX_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label '{0}' longer than 16 characters")]
    TooLong(String),

    #[error("short label '{short}' is not part of label '{label}'")]
    ShortNotSubset { label: String, short: String },

    #[error("short label '{0}' selects more than 8 characters")]
    ShortTooLong(String),

    #[error("extended label is {0} bytes, maximum is 32")]
    ExtendedTooLong(usize),
}

/// A DAB label: up to 16 EBU Latin characters plus a character flag that
/// selects up to 8 of them as the short variant (FIG 1), and an optional
/// UTF-8 extended label of up to 32 bytes (FIG 2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    text: String,
    flag: u16,
    long_label: Option<String>,
}

impl Label {
    /// Build a label, deriving the character flag from the short variant.
    /// The short label must select its characters, in order, from the full
    /// text.
    pub fn new(text: &str, short: Option<&str>) -> Result<Self, LabelError> {
        if text.chars().count() > LABEL_LEN {
            return Err(LabelError::TooLong(text.to_owned()));
        }

        let flag = match short {
            Some(short) => derive_flag(text, short)?,
            None => default_flag(text),
        };

        Ok(Label {
            text: text.to_owned(),
            flag,
            long_label: None,
        })
    }

    pub fn from_flag(text: &str, flag: u16) -> Result<Self, LabelError> {
        if text.chars().count() > LABEL_LEN {
            return Err(LabelError::TooLong(text.to_owned()));
        }
        Ok(Label {
            text: text.to_owned(),
            flag,
            long_label: None,
        })
    }

    pub fn set_long_label(&mut self, long: &str) -> Result<(), LabelError> {
        if long.len() > FIG2_LABEL_MAX_BYTES {
            return Err(LabelError::ExtendedTooLong(long.len()));
        }
        self.long_label = Some(long.to_owned());
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn flag(&self) -> u16 {
        self.flag
    }

    /// UTF-8 extended label, if one is configured.
    pub fn long_label(&self) -> Option<&str> {
        self.long_label.as_deref()
    }

    pub fn has_fig2_label(&self) -> bool {
        self.long_label.is_some()
    }

    /// The 16-byte EBU Latin character field, space padded.
    pub fn ebu_bytes(&self) -> [u8; LABEL_LEN] {
        let mut out = [b' '; LABEL_LEN];
        for (dst, src) in out.iter_mut().zip(charset::utf8_to_ebu(&self.text)) {
            *dst = src;
        }
        out
    }

    /// The short variant selected by the character flag.
    pub fn short_text(&self) -> String {
        self.text
            .chars()
            .enumerate()
            .filter(|(i, _)| self.flag & (0x8000 >> i) != 0)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn validate(&self) -> Result<(), LabelError> {
        if self.text.chars().count() > LABEL_LEN {
            return Err(LabelError::TooLong(self.text.clone()));
        }
        if self.flag.count_ones() > 8 {
            return Err(LabelError::ShortTooLong(self.short_text()));
        }
        if let Some(long) = &self.long_label {
            if long.len() > FIG2_LABEL_MAX_BYTES {
                return Err(LabelError::ExtendedTooLong(long.len()));
            }
        }
        Ok(())
    }
}

/// With no explicit short label, select the first characters up to eight.
fn default_flag(text: &str) -> u16 {
    let n = text.chars().count().min(8);
    let mut flag = 0u16;
    for i in 0..n {
        flag |= 0x8000 >> i;
    }
    flag
}

fn derive_flag(text: &str, short: &str) -> Result<u16, LabelError> {
    if short.chars().count() > 8 {
        return Err(LabelError::ShortTooLong(short.to_owned()));
    }

    let mut flag = 0u16;
    let mut short_chars = short.chars().peekable();

    for (i, c) in text.chars().enumerate() {
        match short_chars.peek() {
            Some(&s) if s == c => {
                flag |= 0x8000 >> i;
                short_chars.next();
            }
            Some(_) => {}
            None => break,
        }
    }

    if short_chars.peek().is_some() {
        return Err(LabelError::ShortNotSubset {
            label: text.to_owned(),
            short: short.to_owned(),
        });
    }

    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_from_short_label() {
        let label = Label::new("OpenDigitalRadio", Some("ODR")).unwrap();
        assert_eq!(label.flag(), 0x8000 | 0x0800 | 0x0010);
        assert_eq!(label.short_text(), "ODR");
    }

    #[test]
    fn default_flag_takes_first_eight() {
        let label = Label::new("Test", None).unwrap();
        assert_eq!(label.flag(), 0xF000);
        assert_eq!(label.short_text(), "Test");
    }

    #[test]
    fn short_must_be_subsequence() {
        assert_eq!(
            Label::new("Radio", Some("XYZ")),
            Err(LabelError::ShortNotSubset {
                label: "Radio".into(),
                short: "XYZ".into()
            })
        );
    }

    #[test]
    fn overlong_label_rejected() {
        assert!(Label::new("This is much too long for DAB", None).is_err());
    }

    #[test]
    fn ebu_bytes_padded() {
        let label = Label::new("Test", None).unwrap();
        let mut expected = [b' '; 16];
        expected[..4].copy_from_slice(b"Test");
        assert_eq!(label.ebu_bytes(), expected);
    }

    #[test]
    fn long_label_length_checked() {
        let mut label = Label::new("Test", None).unwrap();
        assert!(label.set_long_label("Radio Svizzera Italiana").is_ok());
        assert!(label
            .set_long_label("An extended label that does not fit in 32 bytes")
            .is_err());
    }
}
