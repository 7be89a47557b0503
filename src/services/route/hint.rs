/// `key:value` pairs collected from SQL comment blocks, in source order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlHints {
    entries: Vec<(String, String)>,
}

impl SqlHints {
    /// Parse every `/* ... */` block of every comment. Text without block
    /// delimiters is read as a single block body.
    pub fn parse(comments: &[String]) -> Self {
        let mut entries = Vec::new();
        for comment in comments {
            if comment.contains("/*") {
                let mut rest = comment.as_str();
                while let Some(start) = rest.find("/*") {
                    let body_start = start + 2;
                    let (body, next) = match rest[body_start..].find("*/") {
                        Some(end) => (&rest[body_start..body_start + end], body_start + end + 2),
                        None => (&rest[body_start..], rest.len()),
                    };
                    parse_block(body, &mut entries);
                    rest = &rest[next..];
                }
            } else {
                parse_block(comment, &mut entries);
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for a key, case-insensitive
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

fn parse_block(body: &str, entries: &mut Vec<(String, String)>) {
    for item in body.split(',') {
        if let Some((key, value)) = item.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                entries.push((key.to_string(), value.trim().to_string()));
            }
        }
    }
}
