use std::net::SocketAddr;

use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "fluxmqd", about = "Clustered MQTT broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Node name, must be unique within the cluster
    #[structopt(name = "node-name", long)]
    pub node_name: Option<String>,

    ///Static cluster peers, --cluster-peers "10.0.0.2:5363" "10.0.0.3:5363"
    #[structopt(name = "cluster-peers", long)]
    pub cluster_peers: Option<Vec<SocketAddr>>,
}
