//! EBU Latin based character set of ETSI TS 101 756 Annex C, used by the
//! FIG 1 labels. Index in the table is the EBU byte value; code point 0
//! cannot be represented.

use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const EBU_LATIN_TO_UNICODE: [char; 256] = [
    '\u{FFFD}', 'Ę', 'Į', 'Ų', 'Ă', 'Ė', 'Ď', 'Ș', 'Ț', 'Ċ', '\n', '\u{B}', 'Ġ', 'Ĺ', 'Ż', 'Ń',
    'ą', 'ę', 'į', 'ų', 'ă', 'ė', 'ď', 'ș', 'ț', 'ċ', 'Ň', 'Ě', 'ġ', 'ĺ', 'ż', '\u{82}',
    ' ', '!', '"', '#', 'ł', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '@', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '[', 'Ů', ']', 'Ł', '_',
    'Ą', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '«', 'ů', '»', 'Ľ', 'Ħ',
    'á', 'à', 'é', 'è', 'í', 'ì', 'ó', 'ò', 'ú', 'ù', 'Ñ', 'Ç', 'Ş', 'ß', '¡', 'Ÿ',
    'â', 'ä', 'ê', 'ë', 'î', 'ï', 'ô', 'ö', 'û', 'ü', 'ñ', 'ç', 'ş', 'ğ', 'ı', 'ÿ',
    'Ķ', 'Ņ', '©', 'Ģ', 'Ğ', 'ě', 'ň', 'ő', 'Ő', '€', '£', '$', 'Ā', 'Ē', 'Ī', 'Ū',
    'ķ', 'ņ', 'Ļ', 'ģ', 'ļ', 'İ', 'ń', 'ű', 'Ű', '¿', 'ľ', '°', 'ā', 'ē', 'ī', 'ū',
    'Á', 'À', 'É', 'È', 'Í', 'Ì', 'Ó', 'Ò', 'Ú', 'Ù', 'Ř', 'Č', 'Š', 'Ž', 'Ð', 'Ŀ',
    'Â', 'Ä', 'Ê', 'Ë', 'Î', 'Ï', 'Ô', 'Ö', 'Û', 'Ü', 'ř', 'č', 'š', 'ž', 'đ', 'ŀ',
    'Ã', 'Å', 'Æ', 'Œ', 'ŷ', 'Ý', 'Õ', 'Ø', 'Þ', 'Ŋ', 'Ŕ', 'Ć', 'Ś', 'Ź', 'Ť', 'ð',
    'ã', 'å', 'æ', 'œ', 'ŵ', 'ý', 'õ', 'ø', 'þ', 'ŋ', 'ŕ', 'ć', 'ś', 'ź', 'ť', 'ħ',
];

static UNICODE_TO_EBU_LATIN: Lazy<HashMap<char, u8>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (i, &c) in EBU_LATIN_TO_UNICODE.iter().enumerate().skip(1) {
        map.entry(c).or_insert(i as u8);
    }
    map
});

/// True if the character has an EBU Latin representation.
pub fn is_encodable(c: char) -> bool {
    UNICODE_TO_EBU_LATIN.contains_key(&c)
}

/// Convert to EBU Latin. Characters outside the table become spaces,
/// matching what receivers expect rather than failing mid-transmission.
pub fn utf8_to_ebu(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| UNICODE_TO_EBU_LATIN.get(&c).copied().unwrap_or(b' '))
        .collect()
}

pub fn ebu_to_utf8(data: &[u8]) -> String {
    data.iter()
        .map(|&b| EBU_LATIN_TO_UNICODE[b as usize])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_subset_is_identity() {
        let s = "Radio DAB+ 64";
        assert_eq!(utf8_to_ebu(s), s.bytes().collect::<Vec<u8>>());
        assert_eq!(ebu_to_utf8(s.as_bytes()), s);
    }

    #[test]
    fn accented_roundtrip() {
        let s = "Français ø";
        let ebu = utf8_to_ebu(s);
        assert_eq!(ebu_to_utf8(&ebu), s);
    }

    #[test]
    fn unknown_becomes_space() {
        assert_eq!(utf8_to_ebu("入"), vec![b' ']);
        assert!(!is_encodable('入'));
        assert!(is_encodable('é'));
    }
}
