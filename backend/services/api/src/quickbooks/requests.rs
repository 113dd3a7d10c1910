use serde::Deserialize;

/// Query string Intuit appends to the redirect URI.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub realm_id: Option<String>,
    pub error: Option<String>,
    #[serde(rename = "error_description")]
    pub error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub entity_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntityListQuery {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionQuery {
    /// Also call the company endpoint with the stored token.
    #[serde(default)]
    pub verify: bool,
}
