use crate::error::AppError;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = AppError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, AppError>> + Send>>;

/// Both halves of one open push channel.
pub struct PushChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens push channels. The connection manager owns the only caller.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<PushChannel, AppError>> + Send;
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    config: WebSocketConfig,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            config: WebSocketConfig {
                max_message_size: Some(64 << 20),
                max_frame_size: Some(16 << 20),
                ..Default::default()
            },
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<PushChannel, AppError>> + Send {
        let request = url.to_string();
        let ws_config = self.config.clone();

        async move {
            let (websocket_stream, _) =
                connect_async_with_config(request, Some(ws_config), true).await?;
            let (sink, stream) = websocket_stream.split();

            Ok(PushChannel {
                sink: Box::pin(sink.sink_map_err(AppError::from)),
                stream: Box::pin(stream.map(|frame| frame.map_err(AppError::from))),
            })
        }
    }
}
