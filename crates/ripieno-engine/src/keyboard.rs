//! Per-channel MIDI keyboard state.

use crate::instrument::ReleaseTrigger;
use ripieno_core::{Pool, RtList, SchedTime, ScriptCallbackId, Token};

pub const KEY_COUNT: usize = 128;

/// State of one MIDI key.
#[derive(Debug, Default)]
pub struct MidiKey {
    /// Physically held down.
    pub pressed: bool,
    /// Some note on this key still has voices (or queued thefts).
    pub active: bool,
    /// Whether to spawn release-trigger voices, and on which occasions.
    pub release_trigger: ReleaseTrigger,
    /// Latest note-on velocity.
    pub velocity: u8,
    /// Scheduler time of the latest note-on.
    pub note_on_time: SchedTime,
    /// Voices postponed to the stealing queue for this key.
    pub voice_thefts_queued: u32,
    /// Active notes, threaded through the engine's note pool.
    pub active_notes: RtList,
    /// This fragment's events for the key, threaded through the event pool.
    pub events: RtList,
    /// Membership in the active-keys list, while on it.
    pub item: Option<Token>,
    /// Held by sostenuto pedal.
    pub sostenuto: bool,
    /// Script instance retained from the key's note handler, so its
    /// polyphonic variables reach the matching release handler.
    pub script_event: Option<ScriptCallbackId>,
    /// Per-key NRPN volume override (linear gain).
    pub volume: f32,
    /// Per-key NRPN pan override.
    pub pan: f32,
}

impl MidiKey {
    fn reset(&mut self) {
        self.pressed = false;
        self.active = false;
        self.release_trigger = ReleaseTrigger::default();
        self.velocity = 0;
        self.note_on_time = 0;
        self.voice_thefts_queued = 0;
        self.item = None;
        self.sostenuto = false;
        self.script_event = None;
        self.volume = 1.0;
        self.pan = 0.0;
        // note/event lists are cleared by the engine against its pools
    }
}

/// The 128 keys of one engine channel plus pedal state and the active-keys
/// list used for oldest-key voice stealing.
pub struct MidiKeyboard {
    pub keys: Vec<MidiKey>,
    /// Small integer pool backing the active-keys list.
    key_pool: Pool<u8>,
    pub active_keys: RtList,
    pub sustain_pedal: bool,
    pub sostenuto_pedal: bool,
    /// Round-robin counter per key, advanced on real note-ons.
    pub round_robin: [u32; KEY_COUNT],
}

impl MidiKeyboard {
    pub fn new() -> Self {
        let mut keys = Vec::with_capacity(KEY_COUNT);
        for _ in 0..KEY_COUNT {
            let mut key = MidiKey::default();
            key.volume = 1.0;
            keys.push(key);
        }
        Self {
            keys,
            key_pool: Pool::new(KEY_COUNT),
            active_keys: RtList::new(),
            sustain_pedal: false,
            sostenuto_pedal: false,
            round_robin: [0; KEY_COUNT],
        }
    }

    /// Put `key` on the active-keys list (idempotent).
    pub fn mark_key_active(&mut self, key: u8) {
        let entry = &mut self.keys[key as usize];
        entry.active = true;
        if entry.item.is_none() {
            if let Some(token) = self.key_pool.alloc_append(&mut self.active_keys) {
                if let Some(slot) = self.key_pool.get_mut(token) {
                    *slot = key;
                }
                entry.item = Some(token);
            }
        }
    }

    /// Remove `key` from the active-keys list once its notes are gone.
    pub fn release_key_slot(&mut self, key: u8) {
        let entry = &mut self.keys[key as usize];
        entry.active = false;
        entry.release_trigger = ReleaseTrigger::default();
        if let Some(token) = entry.item.take() {
            self.key_pool.free(&mut self.active_keys, token);
        }
    }

    pub fn first_active_key(&self) -> Option<(Token, u8)> {
        let token = self.key_pool.first(&self.active_keys)?;
        Some((token, *self.key_pool.get(token)?))
    }

    pub fn last_active_key(&self) -> Option<(Token, u8)> {
        let token = self.key_pool.last(&self.active_keys)?;
        Some((token, *self.key_pool.get(token)?))
    }

    pub fn next_active_key(&self, token: Token) -> Option<(Token, u8)> {
        let next = self.key_pool.next(token)?;
        Some((next, *self.key_pool.get(next)?))
    }

    pub fn key_at(&self, token: Token) -> Option<u8> {
        self.key_pool.get(token).copied()
    }

    /// Whether a note-off (or pedal change) may release voices on `key`:
    /// neither sustain nor sostenuto-on-key is holding.
    pub fn should_release_key(&self, key: u8) -> bool {
        !self.sustain_pedal && !self.keys[key as usize].sostenuto
    }

    /// Sostenuto pedal down: capture all currently pressed keys.
    pub fn sostenuto_down(&mut self) {
        self.sostenuto_pedal = true;
        for key in self.keys.iter_mut() {
            key.sostenuto = key.pressed;
        }
    }

    /// Sostenuto pedal up: drop all captures.
    pub fn sostenuto_up(&mut self) {
        self.sostenuto_pedal = false;
        for key in self.keys.iter_mut() {
            key.sostenuto = false;
        }
    }

    /// Keys no longer pressed but held by the sustain pedal; these get
    /// synthesised release events on pedal-up.
    pub fn pedal_held_keys(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.active && !k.pressed)
            .map(|(i, _)| i as u8)
    }

    /// Full reset; the caller must already have cleared per-key note and
    /// event lists against the engine pools.
    pub fn reset(&mut self) {
        for key in self.keys.iter_mut() {
            key.reset();
        }
        self.key_pool.clear_list(&mut self.active_keys);
        self.sustain_pedal = false;
        self.sostenuto_pedal = false;
        self.round_robin = [0; KEY_COUNT];
    }
}

impl Default for MidiKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_keys_kept_in_age_order() {
        let mut kb = MidiKeyboard::new();
        kb.mark_key_active(60);
        kb.mark_key_active(64);
        kb.mark_key_active(67);
        // marking twice does not duplicate
        kb.mark_key_active(60);
        assert_eq!(kb.active_keys.len(), 3);

        let (t0, k0) = kb.first_active_key().unwrap();
        assert_eq!(k0, 60);
        let (t1, k1) = kb.next_active_key(t0).unwrap();
        assert_eq!(k1, 64);
        let (_, k2) = kb.next_active_key(t1).unwrap();
        assert_eq!(k2, 67);
        assert_eq!(kb.last_active_key().unwrap().1, 67);

        kb.release_key_slot(64);
        assert_eq!(kb.active_keys.len(), 2);
        assert!(!kb.keys[64].active);
    }

    #[test]
    fn test_should_release_honours_pedals() {
        let mut kb = MidiKeyboard::new();
        assert!(kb.should_release_key(60));

        kb.sustain_pedal = true;
        assert!(!kb.should_release_key(60));
        kb.sustain_pedal = false;

        kb.keys[60].pressed = true;
        kb.sostenuto_down();
        kb.keys[60].pressed = false;
        assert!(!kb.should_release_key(60));
        // other keys are unaffected
        assert!(kb.should_release_key(61));

        kb.sostenuto_up();
        assert!(kb.should_release_key(60));
    }

    #[test]
    fn test_pedal_held_keys() {
        let mut kb = MidiKeyboard::new();
        kb.mark_key_active(60);
        kb.keys[60].pressed = false;
        kb.mark_key_active(62);
        kb.keys[62].pressed = true;
        let held: Vec<u8> = kb.pedal_held_keys().collect();
        assert_eq!(held, vec![60]);
    }
}
