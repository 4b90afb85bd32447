//! 传输状态机
//!
//! `Connecting → Connected → Closed`，或 `Connecting/Connected → Failed`。
//! 终止状态之后的任何输入都被忽略，因此每种通知最多发出一次。

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    pub fn can_send(self) -> bool {
        self == TransportState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportInput {
    LinkOpened,
    LinkFailed,
    LinkClosed,
    /// 本地销毁，不产生通知
    Destroy,
}

/// 需要向上层报告的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportNotice {
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub next: TransportState,
    pub notice: Option<TransportNotice>,
}

impl Step {
    fn stay(state: TransportState) -> Self {
        Self {
            next: state,
            notice: None,
        }
    }

    fn to(next: TransportState, notice: TransportNotice) -> Self {
        Self {
            next,
            notice: Some(notice),
        }
    }
}

pub fn transition(state: TransportState, input: TransportInput) -> Step {
    use TransportInput as I;
    use TransportState as S;

    match (state, input) {
        (S::Failed | S::Closed, _) => Step::stay(state),
        (_, I::Destroy) => Step {
            next: S::Closed,
            notice: None,
        },
        (S::Connecting, I::LinkOpened) => Step::to(S::Connected, TransportNotice::Connected),
        (S::Connected, I::LinkOpened) => Step::stay(state),
        (S::Connecting | S::Connected, I::LinkFailed) => {
            Step::to(S::Failed, TransportNotice::Failed)
        }
        // 协商完成前通道就关闭，视为失败
        (S::Connecting, I::LinkClosed) => Step::to(S::Failed, TransportNotice::Failed),
        (S::Connected, I::LinkClosed) => Step::to(S::Closed, TransportNotice::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_INPUTS: [TransportInput; 4] = [
        TransportInput::LinkOpened,
        TransportInput::LinkFailed,
        TransportInput::LinkClosed,
        TransportInput::Destroy,
    ];

    #[test]
    fn test_happy_path() {
        let step = transition(TransportState::Connecting, TransportInput::LinkOpened);
        assert_eq!(step.next, TransportState::Connected);
        assert_eq!(step.notice, Some(TransportNotice::Connected));

        let step = transition(step.next, TransportInput::LinkClosed);
        assert_eq!(step.next, TransportState::Closed);
        assert_eq!(step.notice, Some(TransportNotice::Closed));
    }

    #[test]
    fn test_failure_from_live_states() {
        for state in [TransportState::Connecting, TransportState::Connected] {
            let step = transition(state, TransportInput::LinkFailed);
            assert_eq!(step.next, TransportState::Failed);
            assert_eq!(step.notice, Some(TransportNotice::Failed));
        }
        let step = transition(TransportState::Connecting, TransportInput::LinkClosed);
        assert_eq!(step.next, TransportState::Failed);
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        for state in [TransportState::Failed, TransportState::Closed] {
            for input in ALL_INPUTS {
                assert_eq!(transition(state, input), Step::stay(state));
            }
        }
    }

    #[test]
    fn test_destroy_is_silent() {
        for state in [TransportState::Connecting, TransportState::Connected] {
            let step = transition(state, TransportInput::Destroy);
            assert_eq!(step.next, TransportState::Closed);
            assert_eq!(step.notice, None);
        }
    }

    #[test]
    fn test_each_notice_fires_at_most_once() {
        let mut state = TransportState::Connecting;
        let mut notices = Vec::new();
        let inputs = [
            TransportInput::LinkOpened,
            TransportInput::LinkOpened,
            TransportInput::LinkFailed,
            TransportInput::LinkFailed,
            TransportInput::LinkClosed,
        ];
        for input in inputs {
            let step = transition(state, input);
            state = step.next;
            notices.extend(step.notice);
        }
        assert_eq!(
            notices,
            vec![TransportNotice::Connected, TransportNotice::Failed]
        );
    }

    #[test]
    fn test_only_connected_can_send() {
        assert!(TransportState::Connected.can_send());
        assert!(!TransportState::Connecting.can_send());
        assert!(!TransportState::Failed.can_send());
        assert!(!TransportState::Closed.can_send());
    }
}
