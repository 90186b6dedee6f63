use config::Config;
use tracing::info;

const DEFAULT_BLOCKS: (&str, &str) = ("blocks", "blocks.json");
const DEFAULT_STOP_ON_REJECTION: (&str, bool) = ("stop-on-rejection", true);

pub struct ReplayerConfig {
    /// JSON file holding the blocks to replay, in chain order
    pub blocks: String,

    /// Stop at the first rejected block rather than skipping the rest of its branch
    pub stop_on_rejection: bool,
}

impl ReplayerConfig {
    pub fn new(config: &Config) -> Self {
        let blocks = config.get_string(DEFAULT_BLOCKS.0).unwrap_or(DEFAULT_BLOCKS.1.to_string());
        info!("Replaying blocks from '{}'", blocks);

        let stop_on_rejection =
            config.get_bool(DEFAULT_STOP_ON_REJECTION.0).unwrap_or(DEFAULT_STOP_ON_REJECTION.1);

        Self {
            blocks,
            stop_on_rejection,
        }
    }
}
