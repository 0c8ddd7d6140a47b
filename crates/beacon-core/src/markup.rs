//! Minimal markup reader for discovery messages.
//!
//! Handles the subset the protocol uses: nested elements, text content,
//! self-closing tags, attributes (skipped), `<?...?>` declarations,
//! comments and the five predefined entities plus numeric references.
//! Mixed content is flattened into the element's text.

use crate::wire::WireError;

/// A parsed element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of the named child, if present.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim())
    }
}

/// Parse a document containing exactly one root element.
pub fn parse(input: &str) -> Result<Element, WireError> {
    let mut reader = Reader { src: input, pos: 0 };
    reader.skip_misc()?;
    let root = reader.element()?;
    reader.skip_misc()?;
    if reader.pos != reader.src.len() {
        return Err(WireError::Malformed("trailing content after root element".into()));
    }
    Ok(root)
}

/// Escape text for element content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn eof(&self) -> WireError {
        WireError::Malformed("unexpected end of document".into())
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '\0');
        self.pos += rest.len() - trimmed.len();
    }

    /// Skip whitespace, declarations and comments between elements.
    fn skip_misc(&mut self) -> Result<(), WireError> {
        loop {
            self.skip_whitespace();
            if self.rest().starts_with("<?") {
                self.skip_past("?>")?;
            } else if self.rest().starts_with("<!--") {
                self.skip_past("-->")?;
            } else if self.rest().starts_with("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_past(&mut self, marker: &str) -> Result<(), WireError> {
        match self.rest().find(marker) {
            Some(i) => {
                self.pos += i + marker.len();
                Ok(())
            }
            None => Err(self.eof()),
        }
    }

    fn name(&mut self) -> Result<&'a str, WireError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(WireError::Malformed("empty element name".into()));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn element(&mut self) -> Result<Element, WireError> {
        if !self.rest().starts_with('<') {
            return Err(WireError::Malformed("expected '<'".into()));
        }
        self.pos += 1;
        let name = self.name()?.to_string();

        // Attributes are not part of the protocol; skip to the end of the tag.
        let rest = self.rest();
        let close = rest.find('>').ok_or_else(|| self.eof())?;
        let self_closing = rest[..close].trim_end().ends_with('/');
        self.pos += close + 1;

        let mut element = Element {
            name,
            ..Element::default()
        };
        if self_closing {
            return Ok(element);
        }

        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.eof());
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let end_name = self.name()?;
                if end_name != element.name {
                    return Err(WireError::Malformed(format!(
                        "mismatched closing tag: expected </{}>, found </{}>",
                        element.name, end_name
                    )));
                }
                self.skip_whitespace();
                if !self.rest().starts_with('>') {
                    return Err(WireError::Malformed("unterminated closing tag".into()));
                }
                self.pos += 1;
                return Ok(element);
            }
            if rest.starts_with("<!--") {
                self.skip_past("-->")?;
                continue;
            }
            if rest.starts_with("<![CDATA[") {
                let body = &rest["<![CDATA[".len()..];
                let end = body.find("]]>").ok_or_else(|| self.eof())?;
                element.text.push_str(&body[..end]);
                self.pos += "<![CDATA[".len() + end + "]]>".len();
                continue;
            }
            if rest.starts_with('<') {
                let child = self.element()?;
                element.children.push(child);
                continue;
            }
            let end = rest.find('<').unwrap_or(rest.len());
            element.text.push_str(&unescape(&rest[..end])?);
            self.pos += end;
        }
    }
}

fn unescape(raw: &str) -> Result<String, WireError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let semi = tail
            .find(';')
            .ok_or_else(|| WireError::Malformed("unterminated entity".into()))?;
        let entity = &tail[..semi];
        let decoded = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            e if e.starts_with("#x") || e.starts_with("#X") => u32::from_str_radix(&e[2..], 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| WireError::Malformed(format!("bad character reference &{e};")))?,
            e if e.starts_with('#') => e[1..]
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| WireError::Malformed(format!("bad character reference &{e};")))?,
            e => return Err(WireError::Malformed(format!("unknown entity &{e};"))),
        };
        out.push(decoded);
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
