use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::FutureExt;
use serenity::model::id::{ChannelId, GuildId};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{GuildQueue, PlaybackRequest, QueueInfo};
use super::session::{PlaybackSession, SessionContext, SessionEnd, SessionResult, SessionState};
use crate::error::TransportError;

/// Fuente de ticks del scheduler.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self);
}

/// Tick a intervalo fijo. Si un tick se atrasa, el siguiente se corre.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Lugar de la sesión de un guild.
///
/// `Draining` mantiene ocupado el guild mientras una sesión se cierra (o
/// mientras se desconecta), para que no se promueva otra hasta que la
/// anterior haya soltado todo.
enum SessionSlot {
    Active(PlaybackSession),
    Draining(Drain),
}

impl SessionSlot {
    fn request(&self) -> Option<&PlaybackRequest> {
        match self {
            Self::Active(session) => Some(session.request()),
            Self::Draining(drain) => drain.request.as_ref(),
        }
    }
}

/// Cierre en curso. Solo quien lo creó (mismo `id`) puede liberar el lugar;
/// `done` se dispara al liberarlo.
struct Drain {
    id: u64,
    request: Option<PlaybackRequest>,
    done: CancellationToken,
}

/// Resultado de intentar tomar el lugar de un guild.
enum Claim {
    /// Había una sesión activa; ahora el lugar es nuestro en `Draining`
    Session(PlaybackSession, u64),
    /// Otro está cerrando el guild
    Busy {
        done: CancellationToken,
        has_request: bool,
    },
    Vacant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipOutcome {
    pub stopped_current: bool,
    pub discarded: usize,
}

impl SkipOutcome {
    pub fn total(&self) -> usize {
        self.discarded + usize::from(self.stopped_current)
    }
}

/// Bucle de control de la reproducción de todos los guilds.
///
/// Orden de bloqueo: `sessions` antes que `queues`. Ningún camino toma
/// `sessions` teniendo una guarda de `queues`.
pub struct PlaybackScheduler {
    queues: DashMap<GuildId, GuildQueue>,
    sessions: DashMap<GuildId, SessionSlot>,
    context: Arc<SessionContext>,
    teardown_timeout: Duration,
    next_drain: AtomicU64,
}

impl PlaybackScheduler {
    pub fn new(context: Arc<SessionContext>, teardown_timeout: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            sessions: DashMap::new(),
            context,
            teardown_timeout,
            next_drain: AtomicU64::new(0),
        }
    }

    /// Agrega al final de la cola del guild. Nunca bloquea ni falla.
    ///
    /// Devuelve la posición en la cola (1 = siguiente).
    pub fn enqueue(&self, request: PlaybackRequest) -> usize {
        let guild_id = request.guild_id;
        self.queues.entry(guild_id).or_default().push(request)
    }

    /// Saca la cabeza de la cola; la cola vacía se elimina.
    pub fn dequeue(&self, guild_id: GuildId) -> Option<PlaybackRequest> {
        let next = self.queues.get_mut(&guild_id).and_then(|mut queue| queue.pop());
        self.queues.remove_if(&guild_id, |_, queue| queue.is_empty());
        next
    }

    /// Detiene la sesión actual (cuenta como el primer salto) y descarta
    /// hasta `count - 1` peticiones más. Más allá del final no hace nada.
    ///
    /// Una sesión que ya se está cerrando cuenta como la actual. Sin sesión
    /// se descartan hasta `count` peticiones.
    pub async fn skip(&self, guild_id: GuildId, count: usize) -> SkipOutcome {
        if count == 0 {
            return SkipOutcome::default();
        }

        let (current, stopped_current) = match self.take_active(guild_id) {
            Claim::Session(session, drain) => (Some((session, drain)), true),
            Claim::Busy { has_request, .. } => (None, has_request),
            Claim::Vacant => (None, false),
        };
        let remaining = count - usize::from(stopped_current);

        // Se descarta antes de liberar el lugar para que ningún tick
        // promueva una petición que iba a ser saltada
        let discarded = self
            .queues
            .get_mut(&guild_id)
            .map(|mut queue| queue.discard(remaining))
            .unwrap_or(0);
        self.queues.remove_if(&guild_id, |_, queue| queue.is_empty());

        if let Some((session, drain)) = current {
            let request = session.request().clone();
            let result = session.teardown(self.teardown_timeout).await;
            self.finish_draining(guild_id, drain);
            self.report(&request, result);
        }

        let outcome = SkipOutcome {
            stopped_current,
            discarded,
        };
        info!("⏭️ Saltadas {} canciones en guild {}", outcome.total(), guild_id);
        outcome
    }

    /// Vacía la cola sin tocar la sesión activa.
    pub fn clear(&self, guild_id: GuildId) -> usize {
        let removed = self
            .queues
            .remove(&guild_id)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0);
        info!("🗑️ Cola limpiada en guild {} ({} canciones)", guild_id, removed);
        removed
    }

    /// Copia consistente de sesión actual + cola.
    pub fn peek(&self, guild_id: GuildId) -> QueueInfo {
        let slot = self.sessions.get(&guild_id);
        let current = slot.as_ref().and_then(|slot| slot.request().cloned());
        // Se lee la cola con la guarda de sesiones tomada: la promoción
        // hace dequeue + insert bajo la misma guarda
        let queue = self.queues.get(&guild_id);

        match queue {
            Some(queue) => QueueInfo {
                current,
                items: queue.items().cloned().collect(),
                total_items: queue.len(),
                total_duration: queue.total_duration(),
            },
            None => QueueInfo {
                current,
                ..QueueInfo::empty()
            },
        }
    }

    pub fn now_playing(&self, guild_id: GuildId) -> Option<(PlaybackRequest, SessionState)> {
        match self.sessions.get(&guild_id).as_deref() {
            Some(SessionSlot::Active(session)) => Some((session.request().clone(), session.state())),
            _ => None,
        }
    }

    pub fn has_session(&self, guild_id: GuildId) -> bool {
        self.sessions.contains_key(&guild_id)
    }

    pub fn queue_len(&self, guild_id: GuildId) -> usize {
        self.queues.get(&guild_id).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Cierra la sesión (si la hay), vacía la cola y desconecta la voz
    /// sin importar el estado de la transmisión.
    ///
    /// Si otro cierre está en curso se espera a que termine antes de tomar
    /// el guild.
    pub async fn force_disconnect(&self, guild_id: GuildId) -> Result<(), TransportError> {
        let drain = loop {
            match self.take_active(guild_id) {
                Claim::Session(session, drain) => {
                    let request = session.request().clone();
                    let result = session.teardown(self.teardown_timeout).await;
                    self.log_outcome(&request, &result);
                    break drain;
                }
                Claim::Busy { done, .. } => done.cancelled().await,
                Claim::Vacant => {
                    if let Some(drain) = self.reserve(guild_id) {
                        break drain;
                    }
                }
            }
        };

        // Con el lugar tomado nada se promueve: la cola se vacía entera
        self.queues.remove(&guild_id);
        let disconnected = self.context.transport.disconnect(guild_id).await;
        self.finish_draining(guild_id, drain);

        info!("👋 Guild {} desconectado", guild_id);
        disconnected
    }

    /// Una pasada por todos los guilds con cola o sesión.
    ///
    /// Un fallo en un guild se registra y no afecta a los demás.
    pub async fn tick(&self) {
        for guild_id in self.busy_guilds() {
            let serviced = AssertUnwindSafe(self.service_guild(guild_id))
                .catch_unwind()
                .await;

            if serviced.is_err() {
                error!("💥 Fallo inesperado atendiendo guild {}", guild_id);
            }
        }
    }

    /// Bucle principal: un tick por cada tick de `ticker` hasta `shutdown`.
    /// Al salir cierra todas las sesiones.
    pub async fn run<T: Ticker>(&self, mut ticker: T, shutdown: CancellationToken, backoff: Duration) {
        info!("🔄 Scheduler de reproducción iniciado");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if AssertUnwindSafe(self.tick()).catch_unwind().await.is_err() {
                error!("💥 Fallo en el tick del scheduler, reintentando en {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        self.shutdown().await;
        info!("⏹️ Scheduler de reproducción detenido");
    }

    /// Cierra todas las sesiones y espera los cierres en curso.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|entry| *entry.key()).collect();

        for guild_id in guilds {
            match self.take_active(guild_id) {
                Claim::Session(session, drain) => {
                    let request = session.request().clone();
                    let result = session.teardown(self.teardown_timeout).await;
                    self.finish_draining(guild_id, drain);
                    self.log_outcome(&request, &result);
                }
                Claim::Busy { done, .. } => done.cancelled().await,
                Claim::Vacant => {}
            }
        }
    }

    async fn service_guild(&self, guild_id: GuildId) {
        // 1. Recoger la sesión terminada
        if self.session_finished(guild_id) {
            if let Claim::Session(session, drain) = self.take_active(guild_id) {
                let request = session.request().clone();
                let result = session.teardown(self.teardown_timeout).await;
                self.finish_draining(guild_id, drain);
                self.report(&request, result);
            }
        }

        // 2. Promover la siguiente petición
        self.promote(guild_id);
    }

    fn busy_guilds(&self) -> BTreeSet<GuildId> {
        let mut guilds: BTreeSet<GuildId> = self.queues.iter().map(|entry| *entry.key()).collect();
        guilds.extend(self.sessions.iter().map(|entry| *entry.key()));
        guilds
    }

    pub(crate) fn session_finished(&self, guild_id: GuildId) -> bool {
        matches!(
            self.sessions.get(&guild_id).as_deref(),
            Some(SessionSlot::Active(session)) if session.is_finished()
        )
    }

    /// Registra una sesión nueva si el guild está libre y tiene cola.
    ///
    /// El dequeue y el insert ocurren bajo la guarda de la entrada, así que
    /// una petición nunca está en la cola y activa a la vez, y nunca hay dos
    /// sesiones en el mismo guild.
    fn promote(&self, guild_id: GuildId) {
        if let Entry::Vacant(slot) = self.sessions.entry(guild_id) {
            if let Some(request) = self.dequeue(guild_id) {
                debug!("▶️ Iniciando sesión de '{}' en guild {}", request.title(), guild_id);
                let session = PlaybackSession::start(request, self.context.clone());
                slot.insert(SessionSlot::Active(session));
            }
        }
    }

    fn new_drain(&self, request: Option<PlaybackRequest>) -> Drain {
        Drain {
            id: self.next_drain.fetch_add(1, Ordering::Relaxed),
            request,
            done: CancellationToken::new(),
        }
    }

    /// Pasa la sesión activa a `Draining` y la devuelve junto al id del cierre.
    fn take_active(&self, guild_id: GuildId) -> Claim {
        let mut slot = match self.sessions.entry(guild_id) {
            Entry::Vacant(_) => return Claim::Vacant,
            Entry::Occupied(slot) => slot,
        };

        if let SessionSlot::Draining(drain) = slot.get() {
            return Claim::Busy {
                done: drain.done.clone(),
                has_request: drain.request.is_some(),
            };
        }

        let drain = self.new_drain(slot.get().request().cloned());
        let id = drain.id;
        match slot.insert(SessionSlot::Draining(drain)) {
            SessionSlot::Active(session) => Claim::Session(session, id),
            SessionSlot::Draining(_) => Claim::Vacant,
        }
    }

    /// Ocupa un guild libre sin sesión, para desconectarlo.
    fn reserve(&self, guild_id: GuildId) -> Option<u64> {
        match self.sessions.entry(guild_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let drain = self.new_drain(None);
                let id = drain.id;
                slot.insert(SessionSlot::Draining(drain));
                Some(id)
            }
        }
    }

    /// Libera el lugar si sigue siendo el cierre `id` y avisa a quien espera.
    fn finish_draining(&self, guild_id: GuildId, id: u64) {
        let released = self.sessions.remove_if(&guild_id, |_, slot| {
            matches!(slot, SessionSlot::Draining(drain) if drain.id == id)
        });

        if let Some((_, SessionSlot::Draining(drain))) = released {
            drain.done.cancel();
        }
    }

    fn log_outcome(&self, request: &PlaybackRequest, result: &SessionResult) {
        match result {
            Ok(end) => debug!("Sesión '{}' cerrada: {:?}", request.title(), end),
            Err(e) => warn!("❌ Sesión '{}' falló: {}", request.title(), e),
        }
    }

    /// Registra y avisa al canal de estado. Los errores son terminales.
    fn report(&self, request: &PlaybackRequest, result: SessionResult) {
        self.log_outcome(request, &result);

        match result {
            Ok(SessionEnd::Completed) | Ok(SessionEnd::Cancelled) => {}
            Ok(SessionEnd::EndedEarly { played, expected }) => self.notify(
                request.status_channel_id,
                format!(
                    "⚠️ **{}** terminó antes de tiempo ({} de {})",
                    request.title(),
                    humantime::format_duration(Duration::from_secs(played.as_secs())),
                    humantime::format_duration(Duration::from_secs(expected.as_secs())),
                ),
            ),
            Err(e) => self.notify(request.status_channel_id, e.user_message(request.title())),
        }
    }

    /// Fire-and-forget: los fallos de envío solo se registran.
    fn notify(&self, channel_id: ChannelId, message: String) {
        let notifier = self.context.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.post(channel_id, message).await {
                warn!("No se pudo enviar mensaje al canal {}: {:?}", channel_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{self, guild, request, Harness};
    use crate::error::ResolveError;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn titles(info: &QueueInfo) -> Vec<String> {
        info.items.iter().map(|r| r.title().to_string()).collect()
    }

    fn playing(scheduler: &PlaybackScheduler, guild_id: GuildId) -> Option<String> {
        scheduler
            .now_playing(guild_id)
            .map(|(request, _)| request.title().to_string())
    }

    #[tokio::test]
    async fn promotes_one_session_per_guild() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();

        scheduler.enqueue(request(1, "A"));
        scheduler.enqueue(request(1, "B"));
        scheduler.enqueue(request(2, "C"));
        scheduler.tick().await;

        assert_eq!(playing(&scheduler, guild(1)).as_deref(), Some("A"));
        assert_eq!(titles(&scheduler.peek(guild(1))), vec!["B"]);
        assert_eq!(playing(&scheduler, guild(2)).as_deref(), Some("C"));
        assert_eq!(scheduler.queue_len(guild(2)), 0);

        harness.wait_transmitting(2).await;
        harness.finish_source("A");
        testing::wait_until(|| scheduler.session_finished(guild(1))).await;
        scheduler.tick().await;

        assert_eq!(playing(&scheduler, guild(1)).as_deref(), Some("B"));
        assert!(scheduler.peek(guild(1)).items.is_empty());
        assert_eq!(playing(&scheduler, guild(2)).as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn requests_are_promoted_in_fifo_order() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        let names: Vec<String> = (0..5).map(|i| format!("t{}", i)).collect();

        for name in &names {
            scheduler.enqueue(request(1, name));
        }

        let mut order = Vec::new();
        for name in &names {
            scheduler.tick().await;
            order.push(playing(&scheduler, guild(1)).unwrap());
            harness.finish_source(name);
            testing::wait_until(|| scheduler.session_finished(guild(1))).await;
        }
        scheduler.tick().await;

        assert_eq!(order, names);
        assert!(!scheduler.has_session(guild(1)));
    }

    #[tokio::test]
    async fn skip_one_with_empty_queue_leaves_guild_idle() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        scheduler.enqueue(request(1, "A"));
        scheduler.tick().await;
        harness.wait_transmitting(1).await;

        let outcome = scheduler.skip(guild(1), 1).await;

        assert_eq!(
            outcome,
            SkipOutcome {
                stopped_current: true,
                discarded: 0
            }
        );
        assert!(!scheduler.has_session(guild(1)));
        assert_eq!(scheduler.queue_len(guild(1)), 0);
        // El salto no suelta la conexión
        assert!(harness.transport.is_connected(guild(1)));
        assert_eq!(harness.transcoder.running(), 0);
    }

    #[tokio::test]
    async fn skip_three_consumes_current_and_two_queued() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        for i in 0..6 {
            scheduler.enqueue(request(1, &format!("q{}", i)));
        }
        scheduler.tick().await;
        assert_eq!(scheduler.queue_len(guild(1)), 5);

        let outcome = scheduler.skip(guild(1), 3).await;

        assert_eq!(outcome.total(), 3);
        assert!(!scheduler.has_session(guild(1)));
        assert_eq!(titles(&scheduler.peek(guild(1))), vec!["q3", "q4", "q5"]);
    }

    #[tokio::test]
    async fn skip_past_queue_end_is_a_no_op() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        scheduler.enqueue(request(1, "a"));
        scheduler.enqueue(request(1, "b"));

        let outcome = scheduler.skip(guild(1), 10).await;

        assert_eq!(
            outcome,
            SkipOutcome {
                stopped_current: false,
                discarded: 2
            }
        );
        assert_eq!(scheduler.skip(guild(1), 1).await, SkipOutcome::default());
    }

    #[tokio::test]
    async fn clear_keeps_active_session() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        scheduler.enqueue(request(1, "A"));
        scheduler.enqueue(request(1, "B"));
        scheduler.enqueue(request(1, "C"));
        scheduler.tick().await;
        harness.wait_transmitting(1).await;

        assert_eq!(scheduler.clear(guild(1)), 2);

        assert_eq!(
            scheduler.now_playing(guild(1)).map(|(r, s)| (r.title().to_string(), s)),
            Some(("A".to_string(), SessionState::Transmitting))
        );
        assert_eq!(scheduler.queue_len(guild(1)), 0);
        assert_eq!(harness.transcoder.terminated(), 0);
    }

    #[tokio::test]
    async fn start_failure_is_reported_and_queue_advances() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        harness
            .resolver
            .fail_open("broken", ResolveError::NotFound("broken".into()));

        scheduler.enqueue(request(1, "broken"));
        scheduler.enqueue(request(1, "good"));
        scheduler.tick().await;
        testing::wait_until(|| scheduler.session_finished(guild(1))).await;
        scheduler.tick().await;

        assert_eq!(playing(&scheduler, guild(1)).as_deref(), Some("good"));
        harness
            .notifier
            .wait_for_message(testing::status_channel(1), "❌ No se encontraron resultados para: broken")
            .await;
        harness
            .notifier
            .wait_for_message(testing::status_channel(1), "🎵 Reproduciendo: **good**")
            .await;
        // Solo se anuncia lo que llega a transmitir
        assert!(!harness
            .notifier
            .has_message(testing::status_channel(1), "🎵 Reproduciendo: **broken**"));
    }

    #[tokio::test]
    async fn panicking_session_does_not_affect_other_guilds() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        harness.resolver.panic_open("bomb");

        scheduler.enqueue(request(1, "bomb"));
        scheduler.enqueue(request(2, "fine"));
        scheduler.tick().await;
        testing::wait_until(|| scheduler.session_finished(guild(1))).await;
        scheduler.tick().await;

        assert!(!scheduler.has_session(guild(1)));
        assert_eq!(playing(&scheduler, guild(2)).as_deref(), Some("fine"));
        harness
            .notifier
            .wait_for_message(testing::status_channel(1), "❌ No se pudo reproducir **bomb**")
            .await;
    }

    #[tokio::test]
    async fn failing_notifier_is_not_fatal() {
        let harness = Harness::new();
        harness.notifier.fail_posts();
        let scheduler = harness.scheduler();

        scheduler.enqueue(request(1, "A"));
        scheduler.tick().await;

        assert_eq!(playing(&scheduler, guild(1)).as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn force_disconnect_then_enqueue_starts_again() {
        let harness = Harness::new();
        let scheduler = harness.scheduler();
        scheduler.enqueue(request(1, "A"));
        scheduler.enqueue(request(1, "B"));
        scheduler.tick().await;
        harness.wait_transmitting(1).await;

        scheduler.force_disconnect(guild(1)).await.unwrap();

        assert!(!scheduler.has_session(guild(1)));
        assert_eq!(scheduler.queue_len(guild(1)), 0);
        assert!(!harness.transport.is_connected(guild(1)));
        assert_eq!(harness.transcoder.running(), 0);

        scheduler.enqueue(request(1, "C"));
        scheduler.tick().await;
        harness.wait_transmitting(2).await;

        assert_eq!(playing(&scheduler, guild(1)).as_deref(), Some("C"));
        assert!(harness.transport.is_connected(guild(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn force_disconnect_waits_for_a_skip_in_progress() {
        let harness = Harness::new();
        harness.transport.set_cancel_delay(Duration::from_millis(300));
        let scheduler = Arc::new(harness.scheduler());
        scheduler.enqueue(request(1, "A"));
        scheduler.tick().await;
        harness.wait_transmitting(1).await;

        let skipping = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.skip(guild(1), 1).await })
        };
        // A se está cerrando: el guild sigue ocupado pero ya no hay sesión activa
        testing::wait_until(|| scheduler.now_playing(guild(1)).is_none()).await;
        assert!(scheduler.has_session(guild(1)));

        scheduler.force_disconnect(guild(1)).await.unwrap();

        assert!(!scheduler.has_session(guild(1)));
        assert!(!harness.transport.is_connected(guild(1)));
        assert!(skipping.await.unwrap().stopped_current);

        scheduler.enqueue(request(1, "B"));
        scheduler.tick().await;
        harness.wait_transmitting(2).await;

        assert_eq!(playing(&scheduler, guild(1)).as_deref(), Some("B"));
        assert!(harness.transport.max_concurrent_per_guild() <= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skip_counts_a_closing_session_as_current() {
        let harness = Harness::new();
        harness.transport.set_cancel_delay(Duration::from_millis(300));
        let scheduler = Arc::new(harness.scheduler());
        for title in ["A", "B", "C", "D"] {
            scheduler.enqueue(request(1, title));
        }
        scheduler.tick().await;
        harness.wait_transmitting(1).await;

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.skip(guild(1), 1).await })
        };
        testing::wait_until(|| scheduler.now_playing(guild(1)).is_none()).await;

        let second = scheduler.skip(guild(1), 2).await;

        assert_eq!(
            second,
            SkipOutcome {
                stopped_current: true,
                discarded: 1
            }
        );
        assert_eq!(first.await.unwrap().total(), 1);
        assert_eq!(titles(&scheduler.peek(guild(1))), vec!["C", "D"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_two_transmissions_per_guild_under_concurrency() {
        let harness = Harness::new();
        let scheduler = Arc::new(harness.scheduler());
        let shutdown = CancellationToken::new();

        let ticking = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                scheduler
                    .run(IntervalTicker::new(Duration::from_millis(1)), shutdown, Duration::from_millis(1))
                    .await
            })
        };

        let mut workers = Vec::new();
        for worker in 0..4u64 {
            let scheduler = scheduler.clone();
            workers.push(tokio::spawn(async move {
                for i in 0..40u64 {
                    let guild_n = 1 + (i % 2);
                    scheduler.enqueue(request(guild_n, &format!("w{}-{}", worker, i)));
                    match (i + worker) % 5 {
                        0 => {
                            scheduler.skip(guild(guild_n), 1).await;
                        }
                        1 => {
                            scheduler.clear(guild(guild_n));
                        }
                        2 => {
                            scheduler.skip(guild(guild_n), 3).await;
                        }
                        _ => {}
                    }
                    let info = scheduler.peek(guild(guild_n));
                    assert_eq!(info.total_items, info.items.len());
                    if let Some(current) = &info.current {
                        assert!(
                            info.items.iter().all(|item| item.title() != current.title()),
                            "'{}' aparece activa y en cola a la vez",
                            current.title()
                        );
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        shutdown.cancel();
        ticking.await.unwrap();

        assert!(harness.transport.max_concurrent_per_guild() <= 1);
        assert_eq!(harness.transcoder.running(), 0);
        assert!(!scheduler.has_session(guild(1)));
        assert!(!scheduler.has_session(guild(2)));
    }

    /// Ticker manual para manejar el bucle desde el test
    struct ChannelTicker(mpsc::Receiver<()>);

    #[async_trait]
    impl Ticker for ChannelTicker {
        async fn tick(&mut self) {
            if self.0.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
    }

    #[tokio::test]
    async fn run_loop_ticks_and_shuts_down_cleanly() {
        let harness = Harness::new();
        let scheduler = Arc::new(harness.scheduler());
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let looping = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                scheduler
                    .run(ChannelTicker(rx), shutdown, Duration::from_millis(1))
                    .await
            })
        };

        scheduler.enqueue(request(1, "A"));
        tx.send(()).await.unwrap();
        harness.wait_transmitting(1).await;
        assert!(scheduler.has_session(guild(1)));

        shutdown.cancel();
        looping.await.unwrap();

        assert!(!scheduler.has_session(guild(1)));
        assert_eq!(harness.transcoder.terminated(), 1);
    }
}
