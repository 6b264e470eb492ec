use anyhow::{Context, Result};
use serenity::model::id::UserId;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use aqualink::node::rest::Rest;
use aqualink::{Aqua, AquaEvent, Config, GatewayPayload};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aqualink=debug".parse()?)
                .add_directive("reqwest=info".parse()?)
                .add_directive("tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Aqualink v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let client_id: u64 = std::env::var("CLIENT_ID")
        .context("CLIENT_ID (id del usuario del bot) es obligatorio")?
        .parse()
        .context("CLIENT_ID debe ser numérico")?;

    // El bot real reenvía estos payloads al shard de la guild
    let (gateway_tx, mut gateway_rx) = mpsc::unbounded_channel::<GatewayPayload>();
    tokio::spawn(async move {
        while let Some(payload) = gateway_rx.recv().await {
            match serde_json::to_string(&payload) {
                Ok(json) => info!("📤 Gateway guild {}: {}", payload.guild_id(), json),
                Err(e) => warn!("Payload de gateway no serializable: {}", e),
            }
        }
    });

    let aqua = Aqua::new(config, UserId::new(client_id), Arc::new(gateway_tx));
    tokio::spawn(log_events(aqua.events().subscribe()));

    info!("🎼 Conectando nodos Lavalink...");
    aqua.init().await?;

    match aqua.load_players().await {
        Ok(0) => {}
        Ok(count) => info!("🔁 {} players restaurados del archivo", count),
        Err(e) => warn!("⚠️ No se pudieron cargar los players: {:#}", e),
    }

    info!("🚀 Aqualink listo");
    tokio::signal::ctrl_c()
        .await
        .context("Error al registrar Ctrl+C")?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    match aqua.save_players().await {
        Ok(count) => info!("💾 {} players guardados", count),
        Err(e) => error!("❌ Error guardando players: {:#}", e),
    }
    aqua.destroy();

    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<AquaEvent>) {
    loop {
        match events.recv().await {
            Ok(AquaEvent::Debug { message }) => debug!("{}", message),
            Ok(AquaEvent::NodeReady { node, resumed }) => {
                info!("✅ Nodo {} listo (sesión reanudada: {})", node, resumed)
            }
            Ok(AquaEvent::NodeFailoverComplete {
                node,
                succeeded,
                failed,
            }) => info!("🚑 Failover de {}: {} ok, {} fallidos", node, succeeded, failed),
            Ok(AquaEvent::TrackStart { guild_id, track }) => {
                info!("▶️ [{}] {}", guild_id, track.title())
            }
            Ok(AquaEvent::PlayerUpdate { .. }) => {}
            Ok(event) => debug!("Evento: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Se perdieron {} eventos", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn health_check(config: &Config) -> Result<()> {
    let mut healthy = 0;
    for node in &config.nodes {
        let rest = Rest::new(node, config)?;
        match rest.get_version().await {
            Ok(version) => {
                println!("{}: OK ({})", node.identifier(), version);
                healthy += 1;
            }
            Err(e) => println!("{}: ERROR ({})", node.identifier(), e),
        }
    }

    if healthy == config.nodes.len() {
        Ok(())
    } else {
        anyhow::bail!("{} de {} nodos no responden", config.nodes.len() - healthy, config.nodes.len());
    }
}
