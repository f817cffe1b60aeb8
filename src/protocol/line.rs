//! Payload line codec
//!
//! A line is an unquoted token followed by comma-separated fields. Non-null
//! fields are double-quoted; backslash, quote, CR and LF are escaped so a
//! logical line never spans more than one physical line. A null is an empty
//! unquoted field.

/// Append one quoted field (or a bare null) to `out`
pub fn push_field(out: &mut String, value: Option<&str>) {
    let Some(value) = value else {
        return;
    };
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
}

/// Format a full line, without the trailing newline
pub fn format_line<'a, I>(token: &str, fields: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut line = String::from(token);
    for field in fields {
        line.push(',');
        push_field(&mut line, field);
    }
    line
}

/// Split a line into its token and decoded fields
pub fn parse_line(line: &str) -> Result<(String, Vec<Option<String>>), String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (token, rest) = match line.find(',') {
        Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
        None => (line, None),
    };

    let token = token.trim();
    if token.is_empty() {
        return Err("line has no token".into());
    }

    let mut fields = Vec::new();
    let Some(rest) = rest else {
        return Ok((token.to_string(), fields));
    };

    let mut chars = rest.chars().peekable();
    loop {
        match chars.peek() {
            // empty field (null) followed by a separator or end of line
            None => {
                fields.push(None);
                break;
            }
            Some(',') => {
                chars.next();
                fields.push(None);
                continue;
            }
            Some('"') => {
                chars.next();
            }
            Some(other) => {
                return Err(format!(
                    "unquoted value starting with '{}' in field {}",
                    other,
                    fields.len() + 1
                ));
            }
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some(other) => {
                        return Err(format!("unknown escape '\\{}' in field {}", other, fields.len() + 1))
                    }
                    None => return Err(format!("dangling escape in field {}", fields.len() + 1)),
                },
                '"' => {
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }
        if !closed {
            return Err(format!("unterminated quote in field {}", fields.len() + 1));
        }
        fields.push(Some(value));

        match chars.next() {
            None => break,
            Some(',') => {
                // a trailing separator introduces one more (null) field
                if chars.peek().is_none() {
                    fields.push(None);
                    break;
                }
            }
            Some(other) => {
                return Err(format!(
                    "expected ',' after field {}, found '{}'",
                    fields.len(),
                    other
                ))
            }
        }
    }

    Ok((token.to_string(), fields))
}
