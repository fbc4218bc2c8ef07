use std::fmt;

use crate::protocol::Method;

/// Protocol state of a session (RFC 2326 §A.1).
///
/// ```text
/// Init ──SETUP──▶ Ready ──PLAY──▶ Playing
///   ▲               │ ▲            │
///   │            SETUP└──PAUSE─────┘
///   └──DESCRIBE (any live state)
///
/// TEARDOWN from any live state ──▶ TornDown (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    TornDown,
    Init,
    Ready,
    Playing,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        self != Self::TornDown
    }

    /// Whether `method` may be dispatched in this state.
    ///
    /// PAUSE additionally requires a seekable, controllable stream; that is
    /// checked by the handler.
    pub fn permits(self, method: Method) -> bool {
        use Method::*;
        use SessionState::*;
        match (self, method) {
            (TornDown, _) => false,
            (_, Options | Describe | Teardown | GetParameter) => true,
            (Init | Ready, Setup) => true,
            (Ready, Play) => true,
            (Playing, Pause) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TornDown => "torn-down",
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Playing => "playing",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use Method::*;
        let allowed: &[(SessionState, &[Method])] = &[
            (SessionState::TornDown, &[]),
            (SessionState::Init, &[Options, Describe, Setup, Teardown, GetParameter]),
            (SessionState::Ready, &[Options, Describe, Setup, Play, Teardown, GetParameter]),
            (SessionState::Playing, &[Options, Describe, Pause, Teardown, GetParameter]),
        ];
        for (state, methods) in allowed {
            for method in Method::ALL {
                let expected = methods.contains(&method) && method.is_implemented();
                assert_eq!(
                    state.permits(method),
                    expected,
                    "{state} / {method}"
                );
            }
        }
    }

    #[test]
    fn ordering_matches_numeric_states() {
        assert!(SessionState::TornDown < SessionState::Init);
        assert!(SessionState::Init < SessionState::Ready);
        assert!(SessionState::Ready < SessionState::Playing);
    }
}
