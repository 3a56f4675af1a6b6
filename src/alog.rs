//! Access-log formatter (C8): a printf-style template engine over
//! per-message fields, grounded on `gw/bb_alog.c`.

use std::sync::Mutex;

use chrono::{TimeZone, Utc};

use crate::message::{Message, MessageBody};

/// One formatted access-log line sink. In the original this writes to a
/// dedicated log file; here it's a `tracing` target so it composes with
/// whatever subscriber the binary installs (§11).
#[derive(Default)]
pub struct AccessLog {
    template: Mutex<String>,
}

impl AccessLog {
    pub fn new(template: String) -> Self {
        AccessLog { template: Mutex::new(template) }
    }

    /// The built-in default line format (`bb_alog.c`'s fallback when no
    /// custom template is configured): a bracket-separated line with
    /// smsc-id, sender/receiver, message body, and the caller's label.
    pub fn default_template() -> Self {
        AccessLog::new("[%i] [%p] [%P] [%a] %l".to_string())
    }

    pub fn set_template(&self, template: String) {
        *self.template.lock().unwrap() = template;
    }

    /// Renders the template against `msg` and the caller-supplied static
    /// label (`"Sent SMS"`, `"Receive SMS"`, `"REJECTED..."`, ...), then
    /// emits it as a single `tracing::info!` line.
    pub fn log(&self, msg: &Message, label: &str) {
        let template = self.template.lock().unwrap().clone();
        let line = render(&template, msg, label);
        tracing::info!(target: "access_log", "{}", line);
    }
}

fn render(template: &str, msg: &Message, label: &str) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut chars = template.chars().peekable();
    let mut word_cursor = WordCursor::new(body_text(msg));

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => out.push('%'),
            Some('%') => out.push('%'),
            Some('l') => out.push_str(label),
            Some('i') => out.push_str(msg.smsc_id.as_deref().unwrap_or("")),
            Some('n') => out.push_str(sms_field(msg, |f| f.service_name.clone()).unwrap_or_default().as_str()),
            Some('A') => out.push_str(sms_field(msg, |f| f.account.clone()).unwrap_or_default().as_str()),
            Some('B') => out.push_str(sms_field(msg, |f| f.billing_info.clone()).unwrap_or_default().as_str()),
            Some('p') => out.push_str(sms_field(msg, |f| Some(f.sender.clone())).unwrap_or_default().as_str()),
            Some('P') => out.push_str(sms_field(msg, |f| Some(f.receiver.clone())).unwrap_or_default().as_str()),
            Some('m') => out.push_str(&format!("{:?}", msg.sms().map(|f| f.message_class))),
            Some('c') => out.push_str(&format!("{:?}", msg.sms().map(|f| f.coding))),
            Some('M') => out.push_str(&msg.sms().map(|f| f.mwi as u8).unwrap_or(0).to_string()),
            Some('C') => out.push_str(&msg.sms().map(|f| f.compress as u8).unwrap_or(0).to_string()),
            Some('d') => out.push_str(&msg.sms().map(|f| f.dlr_mask).unwrap_or(0).to_string()),
            Some('a') => out.push_str(&squeeze_spaces(&hex_if_binary(msg, body_text(msg)))),
            Some('u') => out.push_str(&hex_encode(msg.sms().and_then(|f| f.udhdata.as_deref()).unwrap_or(&[]))),
            Some('U') => out.push_str(&msg.sms().and_then(|f| f.udhdata.as_ref()).map(|u| u.len()).unwrap_or(0).to_string()),
            Some('k') => out.push_str(word_cursor.keyword()),
            Some('s') => out.push_str(&word_cursor.next_word(false)),
            Some('S') => out.push_str(&word_cursor.next_word(true)),
            Some('r') => out.push_str(&word_cursor.rest()),
            Some('b') => out.push_str(&hex_if_binary(msg, body_text(msg))),
            Some('L') => out.push_str(&body_text(msg).len().to_string()),
            Some('t') => out.push_str(&format_time(msg.time)),
            Some('T') => out.push_str(&msg.time.to_string()),
            Some('I') => out.push_str(&msg.id.to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
        }
    }
    out
}

fn sms_field<T>(msg: &Message, f: impl Fn(&crate::message::SmsFields) -> Option<T>) -> Option<T> {
    msg.sms().and_then(f)
}

fn body_text(msg: &Message) -> &str {
    match &msg.body {
        MessageBody::Sms(f) => std::str::from_utf8(&f.msgdata).unwrap_or(""),
        _ => "",
    }
}

fn hex_if_binary(msg: &Message, text: &str) -> String {
    let is_binary = matches!(msg.sms().map(|f| f.coding), Some(crate::message::Coding::Bit8) | Some(crate::message::Coding::Ucs2));
    if is_binary {
        hex_encode(text.as_bytes())
    } else {
        text.to_string()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn squeeze_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

fn format_time(unix_seconds: i64) -> String {
    match Utc.timestamp_opt(unix_seconds, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "invalid-time".to_string(),
    }
}

/// Walks the message body word by word for `%k`/`%s`/`%S`/`%r`.
struct WordCursor {
    words: Vec<String>,
    next: usize,
}

impl WordCursor {
    fn new(text: &str) -> Self {
        WordCursor { words: text.split_whitespace().map(str::to_string).collect(), next: 0 }
    }

    fn keyword(&self) -> &str {
        self.words.first().map(String::as_str).unwrap_or("")
    }

    fn next_word(&mut self, star_to_tilde: bool) -> String {
        let word = self.words.get(self.next).cloned().unwrap_or_default();
        self.next += 1;
        if star_to_tilde {
            word.replace('*', "~")
        } else {
            word
        }
    }

    fn rest(&self) -> String {
        self.words.join("+")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Coding, MessageClass, SmsFields, SmsType};
    use bytes::Bytes;

    fn sample() -> Message {
        Message::new_sms(SmsFields {
            sender: "1000".into(),
            receiver: "+4915112345".into(),
            msgdata: Bytes::from_static(b"hello world"),
            udhdata: None,
            coding: Coding::Default7Bit,
            message_class: MessageClass::Undef,
            mwi: false,
            compress: false,
            dlr_mask: 0,
            dlr_url: None,
            validity: None,
            deferred: None,
            service_name: None,
            account: None,
            billing_info: None,
            priority: 0,
            protocol_id: 0,
            boxc_id: None,
            sms_type: SmsType::Mo,
            split_parts: None,
        })
    }

    #[test]
    fn renders_sender_receiver_and_label() {
        let msg = sample();
        let line = render("[%p] [%P] %l", &msg, "Receive SMS");
        assert_eq!(line, "[1000] [+4915112345] Receive SMS");
    }

    #[test]
    fn keyword_and_rest_split_on_whitespace() {
        let msg = sample();
        let line = render("%k/%r", &msg, "");
        assert_eq!(line, "hello/hello+world");
    }

    #[test]
    fn unknown_escape_is_emitted_literally() {
        let msg = sample();
        assert_eq!(render("%z", &msg, ""), "%z");
    }

    #[test]
    fn literal_percent() {
        let msg = sample();
        assert_eq!(render("100%%", &msg, ""), "100%");
    }
}
