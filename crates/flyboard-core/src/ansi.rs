//! ANSI SGR escape codes to HTML spans.
//!
//! Rendering is a fold of [`reduce`] over the tokens produced by
//! [`tokenize`]. Each call starts from an empty [`StyleState`], so the same
//! input always renders the same markup.

const ESC: char = '\u{1b}';

const PALETTE: [&str; 8] = [
    "#000000", "#cd3131", "#0dbc79", "#e5e510", "#2472c8", "#bc3fbc", "#11a8cd", "#e5e5e5",
];
const BRIGHT_PALETTE: [&str; 8] = [
    "#666666", "#f14c4c", "#23d18b", "#f5f543", "#3b8eea", "#d670d6", "#29b8db", "#ffffff",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnsiToken {
    Text(String),
    /// Parameters of one `ESC [ ... m` sequence. An empty parameter list is
    /// reported as a single `0`.
    Sgr(Vec<u32>),
}

/// Splits `input` into literal text and SGR tokens. Other well-formed CSI
/// sequences are dropped. A malformed or truncated sequence loses only its
/// ESC byte; the characters after it stay as text.
pub fn tokenize(input: &str) -> Vec<AnsiToken> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != ESC {
            text.push(ch);
            continue;
        }
        if chars.peek() != Some(&'[') {
            continue;
        }
        let mut rest = chars.clone();
        rest.next();
        let Some((params, terminator)) = scan_csi(&mut rest) else {
            continue;
        };
        chars = rest;
        if terminator != 'm' {
            continue;
        }
        if !text.is_empty() {
            tokens.push(AnsiToken::Text(std::mem::take(&mut text)));
        }
        tokens.push(AnsiToken::Sgr(parse_params(&params)));
    }
    if !text.is_empty() {
        tokens.push(AnsiToken::Text(text));
    }
    tokens
}

/// Reads the body of one CSI sequence: parameter bytes (`0`-`?`), then
/// intermediate bytes (`!`-`/`), then one final byte (`@`-`~`). Returns
/// `None` when anything else appears or the input ends first.
fn scan_csi<I: Iterator<Item = char>>(chars: &mut I) -> Option<(String, char)> {
    let mut params = String::new();
    let mut intermediate = false;
    for c in chars {
        match c {
            '\u{30}'..='\u{3f}' if !intermediate => params.push(c),
            '\u{21}'..='\u{2f}' => intermediate = true,
            '\u{40}'..='\u{7e}' => return Some((params, c)),
            _ => return None,
        }
    }
    None
}

fn parse_params(params: &str) -> Vec<u32> {
    if params.trim().is_empty() {
        return vec![0];
    }
    params
        .split(|c| c == ';' || c == ':')
        .filter_map(|part| {
            if part.is_empty() {
                Some(0)
            } else {
                part.parse::<u32>().ok()
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub property: &'static str,
    pub value: String,
}

impl Declaration {
    fn new(property: &'static str, value: impl Into<String>) -> Self {
        Self {
            property,
            value: value.into(),
        }
    }
}

/// Active style declarations, at most one per CSS property, in install order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleState {
    declarations: Vec<Declaration>,
}

impl StyleState {
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    pub fn get(&self, property: &str) -> Option<&str> {
        self.declarations
            .iter()
            .find(|d| d.property == property)
            .map(|d| d.value.as_str())
    }

    fn install(&mut self, declaration: Declaration) {
        self.clear(&[declaration.property]);
        self.declarations.push(declaration);
    }

    fn clear(&mut self, properties: &[&str]) {
        self.declarations
            .retain(|d| !properties.contains(&d.property));
    }

    /// Applies one SGR parameter list. Unknown codes are ignored.
    pub fn apply(mut self, codes: &[u32]) -> Self {
        let mut iter = codes.iter().copied();
        while let Some(code) = iter.next() {
            match code {
                0 => self.declarations.clear(),
                1 => self.install(Declaration::new("font-weight", "bold")),
                2 => self.install(Declaration::new("opacity", "0.5")),
                3 => self.install(Declaration::new("font-style", "italic")),
                4 => self.install(Declaration::new("text-decoration", "underline")),
                9 => self.install(Declaration::new("text-decoration", "line-through")),
                22 => self.clear(&["font-weight", "opacity"]),
                23 => self.clear(&["font-style"]),
                24 | 29 => self.clear(&["text-decoration"]),
                30..=37 => self.install(Declaration::new("color", PALETTE[(code - 30) as usize])),
                39 => self.clear(&["color"]),
                40..=47 => self.install(Declaration::new(
                    "background-color",
                    PALETTE[(code - 40) as usize],
                )),
                49 => self.clear(&["background-color"]),
                90..=97 => self.install(Declaration::new(
                    "color",
                    BRIGHT_PALETTE[(code - 90) as usize],
                )),
                100..=107 => self.install(Declaration::new(
                    "background-color",
                    BRIGHT_PALETTE[(code - 100) as usize],
                )),
                38 | 48 => {
                    let property = if code == 38 { "color" } else { "background-color" };
                    if let Some(value) = extended_color(&mut iter) {
                        self.install(Declaration::new(property, value));
                    }
                }
                _ => {}
            }
        }
        self
    }

    /// Inline `style` attribute value for the active declarations.
    pub fn css(&self) -> String {
        self.declarations
            .iter()
            .map(|d| format!("{}:{}", d.property, d.value))
            .collect::<Vec<_>>()
            .join(";")
    }
}

fn extended_color(iter: &mut impl Iterator<Item = u32>) -> Option<String> {
    match iter.next()? {
        5 => xterm_256(iter.next()?),
        2 => {
            let r = iter.next()?.min(255);
            let g = iter.next()?.min(255);
            let b = iter.next()?.min(255);
            Some(format!("rgb({r},{g},{b})"))
        }
        _ => None,
    }
}

fn xterm_256(index: u32) -> Option<String> {
    match index {
        0..=7 => Some(PALETTE[index as usize].to_string()),
        8..=15 => Some(BRIGHT_PALETTE[(index - 8) as usize].to_string()),
        16..=231 => {
            let cube = index - 16;
            let level = |v: u32| if v == 0 { 0 } else { 55 + v * 40 };
            Some(format!(
                "rgb({},{},{})",
                level(cube / 36),
                level((cube / 6) % 6),
                level(cube % 6)
            ))
        }
        232..=255 => {
            let gray = 8 + (index - 232) * 10;
            Some(format!("rgb({gray},{gray},{gray})"))
        }
        _ => None,
    }
}

/// One reducer step: text tokens render against the current state, SGR
/// tokens produce a new state and no output.
pub fn reduce(state: StyleState, token: &AnsiToken) -> (StyleState, String) {
    match token {
        AnsiToken::Text(text) => {
            let out = render_span(&state, text);
            (state, out)
        }
        AnsiToken::Sgr(codes) => (state.apply(codes), String::new()),
    }
}

fn render_span(state: &StyleState, text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let escaped = escape_html(text);
    if state.is_empty() {
        escaped
    } else {
        format!(r#"<span style="{}">{}</span>"#, state.css(), escaped)
    }
}

pub fn ansi_to_html(input: &str) -> String {
    let mut state = StyleState::default();
    let mut out = String::with_capacity(input.len());
    for token in tokenize(input) {
        let (next, fragment) = reduce(state, &token);
        state = next;
        out.push_str(&fragment);
    }
    out
}

/// Plain text of `input` with every escape sequence removed.
pub fn strip_ansi(input: &str) -> String {
    tokenize(input)
        .into_iter()
        .filter_map(|token| match token {
            AnsiToken::Text(text) => Some(text),
            AnsiToken::Sgr(_) => None,
        })
        .collect()
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
