use anyhow::Result;
use serde::Serialize;

use crate::auth::token::{TokenRecord, TokenStatus};
use crate::graph::folders::FolderIdMap;
use crate::graph::messages::FetchReport;

pub fn format_messages(report: &FetchReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn format_folder_ids(folder_ids: &FolderIdMap) -> Result<String> {
    Ok(serde_json::to_string_pretty(folder_ids)?)
}

pub fn format_token_status(status: &TokenStatus) -> Result<String> {
    Ok(serde_json::to_string_pretty(status)?)
}

/// Login summary; the token itself is never printed.
pub fn format_login(record: &TokenRecord) -> Result<String> {
    #[derive(Serialize)]
    struct LoginPayload<'a> {
        signed_in: bool,
        expires_on: Option<i64>,
        scope: Option<&'a str>,
        has_refresh_token: bool,
    }

    let payload = LoginPayload {
        signed_in: true,
        expires_on: record.expires_on,
        scope: record.scope.as_deref(),
        has_refresh_token: record.refresh_token.is_some(),
    };
    Ok(serde_json::to_string_pretty(&payload)?)
}
