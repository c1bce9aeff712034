//! shardllm-worker: listens for root's bootstrap handshake, loads its
//! slice of the model, then runs the forward-pass pipeline in lockstep
//! with root for as many tokens as root generates.

use anyhow::{Context, Result};
use clap::Parser;
use shardllm_brain::bootstrap;
use shardllm_brain::scheduler::TaskLoop;
use shardllm_brain::tasks::{worker, TransformerContext};
use shardllm_brain::transport::SocketServer;

#[derive(Parser)]
#[command(name = "shardllm-worker")]
#[command(about = "Distributed tensor-parallel inference engine — worker node")]
#[command(version)]
struct Args {
    /// TCP port to listen for root's connection on.
    #[arg(long)]
    listen_port: u16,

    /// OS threads driving this node's compute pool.
    #[arg(long, default_value_t = 4)]
    n_threads: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let server = SocketServer::bind(args.listen_port).context("failed to bind listen port")?;
    tracing::info!(port = args.listen_port, "waiting for root");
    let root_socket = server.accept().context("failed to accept root connection")?;

    let bootstrap::WorkerBootstrap { spec, transformer, pool } = bootstrap::load_worker(root_socket).context("bootstrap handshake with root failed")?;
    tracing::info!(slice_index = transformer.slice_index, dim = spec.dim, n_layers = spec.n_layers, "bootstrap complete");

    let ctx = TransformerContext::new(spec, transformer, Some(pool));
    let task_loop = TaskLoop::new(args.n_threads, worker::build(), ctx);

    let mut tokens_processed = 0usize;
    loop {
        let mut flag = [0u8; 1];
        {
            let mut st = task_loop.ctx().state.lock().expect("node state mutex poisoned");
            let pool = st.peers.as_mut().expect("worker always has a peer pool");
            if pool.read(0, &mut flag).is_err() {
                tracing::info!(tokens_processed, "root connection closed, stopping");
                break;
            }
        }
        if flag[0] == 0 {
            tracing::info!(tokens_processed, "root signaled end of generation");
            break;
        }

        task_loop.run();
        tokens_processed += 1;
    }

    Ok(())
}
