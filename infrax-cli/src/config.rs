/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the node's HTTP API
    pub node_url: String,
}
