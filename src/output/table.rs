use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::auth::token::{TokenRecord, TokenStatus};
use crate::graph::folders::FolderIdMap;
use crate::graph::messages::{FetchReport, MailMessage};

const FOLDER_WIDTH: usize = 16;
const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;

pub fn format_messages(report: &FetchReport) -> String {
    let mut out = String::new();

    if report.messages.is_empty() {
        out.push_str("No messages found.\n");
    } else {
        out.push_str(&format!(
            "{:<folder$}  {:<from$}  {:<subject$}  {:<date$}\n",
            "Folder",
            "From",
            "Subject",
            "Received",
            folder = FOLDER_WIDTH,
            from = FROM_WIDTH,
            subject = SUBJECT_WIDTH,
            date = DATE_WIDTH
        ));
        out.push_str(&format!(
            "{}  {}  {}  {}\n",
            "-".repeat(FOLDER_WIDTH),
            "-".repeat(FROM_WIDTH),
            "-".repeat(SUBJECT_WIDTH),
            "-".repeat(DATE_WIDTH)
        ));

        for message in &report.messages {
            let from = message
                .from_name
                .as_deref()
                .or(message.from_address.as_deref())
                .unwrap_or("(unknown)");
            let received = message
                .received_at
                .as_deref()
                .map(relative_date)
                .unwrap_or_else(|| "-".to_string());

            out.push_str(&format!(
                "{}  {}  {}  {}\n",
                pad_to_width(&message.folder, FOLDER_WIDTH),
                pad_to_width(from, FROM_WIDTH),
                pad_to_width(
                    message.subject.as_deref().unwrap_or("(no subject)"),
                    SUBJECT_WIDTH
                ),
                pad_to_width(&received, DATE_WIDTH)
            ));
        }
    }

    push_failures(&mut out, report);
    out
}

/// Every message with its body, separated by rules.
pub fn format_message_bodies(report: &FetchReport) -> String {
    let mut out = String::new();
    if report.messages.is_empty() {
        out.push_str("No messages found.\n");
    }

    for (idx, message) in report.messages.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
            out.push_str(&"-".repeat(80));
            out.push('\n');
        }
        out.push_str(&format_message(message));
    }

    push_failures(&mut out, report);
    out
}

pub fn format_message(message: &MailMessage) -> String {
    let mut out = String::new();
    out.push_str(&format!("Folder: {}\n", message.folder));
    if let Some(id) = &message.id {
        out.push_str(&format!("ID: {id}\n"));
    }
    out.push_str(&format!(
        "Subject: {}\n",
        message.subject.as_deref().unwrap_or("(no subject)")
    ));
    out.push_str(&format!(
        "From: {} <{}>\n",
        message.from_name.as_deref().unwrap_or("(unknown)"),
        message.from_address.as_deref().unwrap_or("(unknown)")
    ));
    if let Some(received_at) = &message.received_at {
        out.push_str(&format!(
            "Received: {received_at} ({})\n",
            relative_date(received_at)
        ));
    }

    out.push('\n');
    out.push_str(message.body_text().as_deref().unwrap_or("(empty)"));
    out.push('\n');
    out
}

fn push_failures(out: &mut String, report: &FetchReport) {
    if report.errors.is_empty() {
        return;
    }

    out.push('\n');
    out.push_str("Failed folders\n");
    out.push_str("--------------\n");
    for failure in &report.errors {
        out.push_str(&format!("{}: {}\n", failure.folder, failure.reason));
    }
}

pub fn format_folder_ids(folder_ids: &FolderIdMap) -> String {
    if folder_ids.is_empty() {
        return "No folders resolved.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("{:<24}  Folder ID\n", "Folder"));
    out.push_str(&format!("{}  {}\n", "-".repeat(24), "-".repeat(40)));
    for (name, id) in folder_ids {
        out.push_str(&format!("{}  {id}\n", pad_to_width(name, 24)));
    }
    out
}

pub fn format_token_status(status: &TokenStatus) -> String {
    let mut out = String::new();
    out.push_str("Token\n");
    out.push_str("=====\n");
    out.push_str(&format!("File:    {}\n", status.path.display()));
    out.push_str(&format!("State:   {}\n", status.state));
    if let Some(expires_at) = status.expires_at {
        out.push_str(&format!("Expires: {}\n", expires_at.to_rfc3339()));
    }
    out.push_str(&format!(
        "Refresh: {}\n",
        if status.has_refresh_token { "yes" } else { "no" }
    ));
    if let Some(detail) = &status.detail {
        out.push_str(&format!("Detail:  {detail}\n"));
    }
    out
}

pub fn format_login(record: &TokenRecord) -> String {
    match record.expires_at() {
        Some(expires_at) => format!("Signed in. Token valid until {}.", expires_at.to_rfc3339()),
        None => "Signed in.".to_string(),
    }
}

fn relative_date(input: &str) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = Utc::now().signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    parsed.format("%Y-%m-%d").to_string()
}

/// Truncates to `max_width` display columns and pads with spaces to
/// exactly that width.
fn pad_to_width(value: &str, max_width: usize) -> String {
    let mut out = truncate_for_width(value, max_width);
    let width = UnicodeWidthStr::width(out.as_str());
    out.push_str(&" ".repeat(max_width.saturating_sub(width)));
    out
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
