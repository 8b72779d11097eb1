use serde::Deserialize;

pub(crate) const DEFAULT_LIST_LIMIT: usize = 10_000;

#[derive(Deserialize)]
pub(crate) struct PutQuery {
    #[serde(default)]
    pub sync: bool,
}

#[derive(Deserialize)]
pub(crate) struct GetQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_get_size")]
    pub size: u64,
}

fn default_get_size() -> u64 {
    u64::MAX
}

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    pub mode: Option<String>,
    #[serde(default)]
    pub min_size: u64,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    pub cursor: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_max_size() -> u64 {
    u64::MAX
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}
