//! Language identification and normalization.
//!
//! OCR engines want a three-letter language code. Language identifiers may
//! hand us two-letter codes, bibliographic variants, or nothing at all, so
//! everything goes through [`normalize_language`] first.

use std::fmt;

use clap::ValueEnum;

use crate::{errors::ItemError, prelude::*};

/// A normalized ISO 639 three-letter language code, such as `eng` or `fra`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LanguageCode(String);

impl LanguageCode {
    /// The code as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Two-letter codes and their three-letter equivalents.
const ALPHA2_TO_ALPHA3: &[(&str, &str)] = &[
    ("af", "afr"),
    ("am", "amh"),
    ("ar", "ara"),
    ("az", "aze"),
    ("be", "bel"),
    ("bg", "bul"),
    ("bn", "ben"),
    ("ca", "cat"),
    ("cs", "ces"),
    ("cy", "cym"),
    ("da", "dan"),
    ("de", "deu"),
    ("el", "ell"),
    ("en", "eng"),
    ("eo", "epo"),
    ("es", "spa"),
    ("et", "est"),
    ("eu", "eus"),
    ("fa", "fas"),
    ("fi", "fin"),
    ("fr", "fra"),
    ("ga", "gle"),
    ("gl", "glg"),
    ("gu", "guj"),
    ("he", "heb"),
    ("hi", "hin"),
    ("hr", "hrv"),
    ("hu", "hun"),
    ("hy", "hye"),
    ("id", "ind"),
    ("is", "isl"),
    ("it", "ita"),
    ("ja", "jpn"),
    ("jv", "jav"),
    ("ka", "kat"),
    ("km", "khm"),
    ("kn", "kan"),
    ("ko", "kor"),
    ("la", "lat"),
    ("lt", "lit"),
    ("lv", "lav"),
    ("mk", "mkd"),
    ("ml", "mal"),
    ("mr", "mar"),
    ("ms", "msa"),
    ("my", "mya"),
    ("nb", "nob"),
    ("ne", "nep"),
    ("nl", "nld"),
    ("no", "nor"),
    ("or", "ori"),
    ("pa", "pan"),
    ("pl", "pol"),
    ("pt", "por"),
    ("ro", "ron"),
    ("ru", "rus"),
    ("si", "sin"),
    ("sk", "slk"),
    ("sl", "slv"),
    ("sn", "sna"),
    ("sq", "sqi"),
    ("sr", "srp"),
    ("sv", "swe"),
    ("sw", "swa"),
    ("ta", "tam"),
    ("te", "tel"),
    ("th", "tha"),
    ("tk", "tuk"),
    ("tl", "tgl"),
    ("tr", "tur"),
    ("uk", "ukr"),
    ("ur", "urd"),
    ("uz", "uzb"),
    ("vi", "vie"),
    ("yi", "yid"),
    ("zh", "zho"),
    ("zu", "zul"),
];

/// Three-letter codes that need rewriting: bibliographic variants and
/// macrolanguage members that language identifiers like to return.
const ALPHA3_ALIASES: &[(&str, &str)] = &[
    ("alb", "sqi"),
    ("arm", "hye"),
    ("baq", "eus"),
    ("bur", "mya"),
    ("chi", "zho"),
    ("cmn", "zho"),
    ("cze", "ces"),
    ("dut", "nld"),
    ("fre", "fra"),
    ("geo", "kat"),
    ("ger", "deu"),
    ("gre", "ell"),
    ("ice", "isl"),
    ("mac", "mkd"),
    ("may", "msa"),
    ("per", "fas"),
    ("pes", "fas"),
    ("rum", "ron"),
    ("slo", "slk"),
    ("wel", "cym"),
    ("zsm", "msa"),
];

/// Three-letter codes that aren't the target of a two-letter code, but which
/// we still accept as-is.
const EXTRA_ALPHA3: &[&str] = &["aka", "hat", "tah"];

/// Normalize a detected language to a three-letter code.
pub fn normalize_language(detected: &str) -> Result<LanguageCode, ItemError> {
    let code = detected.trim().to_ascii_lowercase();
    let normalized = match code.len() {
        2 => ALPHA2_TO_ALPHA3
            .iter()
            .find(|(alpha2, _)| *alpha2 == code)
            .map(|(_, alpha3)| *alpha3),
        3 => ALPHA3_ALIASES
            .iter()
            .find(|(alias, _)| *alias == code)
            .map(|(_, alpha3)| *alpha3)
            .or_else(|| {
                ALPHA2_TO_ALPHA3
                    .iter()
                    .map(|(_, alpha3)| *alpha3)
                    .chain(EXTRA_ALPHA3.iter().copied())
                    .find(|alpha3| *alpha3 == code)
            }),
        _ => None,
    };
    normalized
        .map(|alpha3| LanguageCode(alpha3.to_owned()))
        .ok_or_else(|| ItemError::LanguageNormalization {
            detected: detected.to_owned(),
        })
}

/// Guesses the language of a piece of text.
pub trait LanguageIdentifier: Send + Sync + 'static {
    /// Return the most likely language code, or `None` if there's nothing to
    /// go on.
    fn identify(&self, text: &str) -> Option<String>;
}

/// A [`LanguageIdentifier`] backed by [`whatlang`].
#[derive(Debug, Default)]
pub struct WhatlangIdentifier;

impl LanguageIdentifier for WhatlangIdentifier {
    fn identify(&self, text: &str) -> Option<String> {
        let info = whatlang::detect(text)?;
        trace!(
            lang = info.lang().code(),
            confidence = info.confidence(),
            reliable = info.is_reliable(),
            "Identified language"
        );
        Some(info.lang().code().to_owned())
    }
}

/// What to do when we can't normalize the detected language.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LanguageFallback {
    /// Fail the item.
    #[default]
    Abort,

    /// Run the second pass with this language instead.
    Default(LanguageCode),

    /// Use the rough-pass text as the final output.
    RoughPass,
}

/// Command-line spelling of [`LanguageFallback`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum UnknownLanguagePolicy {
    /// Fail the item.
    #[default]
    Abort,

    /// Use `--default-language` for the second pass.
    Default,

    /// Keep the text from the first, language-agnostic pass.
    RoughPass,
}

impl LanguageFallback {
    /// Build a fallback from command-line options.
    pub fn from_opts(policy: UnknownLanguagePolicy, default_language: &str) -> Result<Self> {
        Ok(match policy {
            UnknownLanguagePolicy::Abort => LanguageFallback::Abort,
            UnknownLanguagePolicy::RoughPass => LanguageFallback::RoughPass,
            UnknownLanguagePolicy::Default => LanguageFallback::Default(
                normalize_language(default_language).with_context(|| {
                    format!("invalid --default-language {:?}", default_language)
                })?,
            ),
        })
    }
}
