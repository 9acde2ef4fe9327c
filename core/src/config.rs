pub const DEFAULT_USER_AGENT: &str = "Mozilla/4.0 (compatible; MSIE 8.0; Windows NT 5.2; \
Trident/4.0; .NET CLR 1.1.4322; .NET CLR 2.0.50727; .NET CLR 3.0.04506.30; \
.NET CLR 3.0.4506.2152; .NET CLR 3.5.30729)";

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub user_agent: String,
    pub accept_language: String,
    pub connect_timeout_secs: u64,
    /// Read buffer size of the fetch loop; one progress callback per filled read.
    pub chunk_size: usize,
    /// Bytes that must arrive past the stall point before buffered playback resumes.
    pub cache_margin_bytes: u64,
    pub default_suffix: String,
    pub resume_enabled: bool,
    pub cache_dir_name: String,
    pub playing_check_interval_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "zh-CN".to_string(),
            connect_timeout_secs: 6,
            chunk_size: 64 * 1024,
            cache_margin_bytes: 1024 * 1024,
            default_suffix: ".mp4".to_string(),
            resume_enabled: true,
            cache_dir_name: "Video".to_string(),
            playing_check_interval_ms: 250,
        }
    }
}
