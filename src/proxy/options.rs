//! Proxy options encoded in the recipient address.
//!
//! `txt+bleach+kindle+proxy@example.test` asks for bleached HTML converted to
//! text and delivered to the Kindle address. Tokens are case-insensitive;
//! unknown tokens are ignored.

use crate::mailbox::EmailAddress;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Convert HTML to plain text.
    pub txt: bool,
    /// Sanitise HTML.
    pub bleach: bool,
    /// Inline images as data URIs.
    pub images: bool,
    /// With `txt`, drop links from the text.
    pub wolinks: bool,
    /// Put the content in the body instead of an attachment.
    pub inline: bool,
    /// Deliver to the configured Kindle address.
    pub kindle: bool,
}

impl ProxyOptions {
    /// Parse the tokens of one address's local part.
    pub fn from_address(address: &str) -> Self {
        let local = address.split('@').next().unwrap_or_default();
        let mut opts = Self::default();
        for token in local.split(|c: char| !c.is_ascii_alphanumeric()) {
            match token.to_ascii_lowercase().as_str() {
                "txt" => opts.txt = true,
                "bleach" => opts.bleach = true,
                "images" => opts.images = true,
                "wolinks" => opts.wolinks = true,
                "inline" => opts.inline = true,
                "kindle" => opts.kindle = true,
                _ => {}
            }
        }
        opts
    }

    /// Union of the options on every recipient.
    pub fn from_recipients(recipients: &[EmailAddress]) -> Self {
        recipients
            .iter()
            .map(|r| Self::from_address(&r.address))
            .fold(Self::default(), Self::union)
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            txt: self.txt || other.txt,
            bleach: self.bleach || other.bleach,
            images: self.images || other.images,
            wolinks: self.wolinks || other.wolinks,
            inline: self.inline || other.inline,
            kindle: self.kindle || other.kindle,
        }
    }

    /// Names of the enabled options, for logging.
    pub fn enabled(&self) -> Vec<&'static str> {
        [
            (self.txt, "txt"),
            (self.bleach, "bleach"),
            (self.images, "images"),
            (self.wolinks, "wolinks"),
            (self.inline, "inline"),
            (self.kindle, "kindle"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}
