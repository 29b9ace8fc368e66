pub mod json;
pub mod table;

use anyhow::Result;

use crate::auth::token::{TokenRecord, TokenStatus};
use crate::graph::folders::FolderIdMap;
use crate::graph::messages::FetchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// `bodies` only affects table output; JSON always carries bodies.
pub fn format_messages(format: OutputFormat, report: &FetchReport, bodies: bool) -> Result<String> {
    match format {
        OutputFormat::Table if bodies => Ok(table::format_message_bodies(report)),
        OutputFormat::Table => Ok(table::format_messages(report)),
        OutputFormat::Json => json::format_messages(report),
    }
}

pub fn format_folder_ids(format: OutputFormat, folder_ids: &FolderIdMap) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_folder_ids(folder_ids)),
        OutputFormat::Json => json::format_folder_ids(folder_ids),
    }
}

pub fn format_token_status(format: OutputFormat, status: &TokenStatus) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_token_status(status)),
        OutputFormat::Json => json::format_token_status(status),
    }
}

pub fn format_login(format: OutputFormat, record: &TokenRecord) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_login(record)),
        OutputFormat::Json => json::format_login(record),
    }
}
