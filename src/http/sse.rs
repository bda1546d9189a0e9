use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use log::info;
use tokio_stream::wrappers::ReceiverStream;

use crate::dose::{SoundDose, SoundDoseManager};
use crate::listener::{ChannelListener, DoseEvent};

use super::routes::HttpServerError;

pub type DoseEventStream = Sse<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>;

/// Reports the listener's death when the SSE connection goes away.
struct ConnectionGuard {
    surface: SoundDose,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        info!(
            "[SoundDoseHttp] Event stream for listener #{} closed",
            self.surface.registration_id()
        );
        self.surface.on_disconnected();
    }
}

fn event_name(event: &DoseEvent) -> &'static str {
    match event {
        DoseEvent::MomentaryExposure { .. } => "momentary_exposure",
        DoseEvent::NewCsdValue { .. } => "new_csd_value",
    }
}

/// Register the connection as the listener and stream its events.
pub fn dose_events(manager: &SoundDoseManager) -> Result<DoseEventStream, HttpServerError> {
    let (listener, receiver) = ChannelListener::new();
    let surface = manager.get_sound_dose_interface(Arc::new(listener))?;
    info!(
        "[SoundDoseHttp] Event stream registered as listener #{}",
        surface.registration_id()
    );
    let guard = ConnectionGuard { surface };

    let stream = ReceiverStream::new(receiver).filter_map(move |event| {
        let _guard = &guard;
        let payload = serde_json::to_string(&event);
        async move {
            match payload {
                Ok(payload) => Some(Ok(Event::default().event(event_name(&event)).data(payload))),
                Err(_) => None,
            }
        }
    });

    Ok(Sse::new(Box::pin(stream) as Pin<Box<_>>).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(5))
            .text("sound-dose-keepalive"),
    ))
}
