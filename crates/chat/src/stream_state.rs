/// Lifecycle of one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    BuildingRequest,
    AwaitingFirstToken,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// State transition input for the generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    Begin,
    RequestOpened,
    FragmentReceived,
    Complete,
    Fail,
    Cancel,
}

/// Rejection reason for illegal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyActive {
        active: StreamPhase,
    },
    NoActiveStream {
        attempted: StreamTransition,
    },
    OutOfOrder {
        from: StreamPhase,
        attempted: StreamTransition,
    },
}

pub type StreamTransitionResult = Result<StreamPhase, StreamTransitionRejection>;

impl StreamPhase {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::BuildingRequest | Self::AwaitingFirstToken | Self::Streaming
        )
    }

    /// Applies one transition deterministically.
    ///
    /// Idle and terminal phases may begin a new request directly. `Fail` and `Cancel` are
    /// legal from any active phase; an empty stream may complete without a fragment.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Begin => self.apply_begin(),
            StreamTransition::RequestOpened => {
                self.advance(transition, &[Self::BuildingRequest], Self::AwaitingFirstToken)
            }
            StreamTransition::FragmentReceived => self.advance(
                transition,
                &[Self::AwaitingFirstToken, Self::Streaming],
                Self::Streaming,
            ),
            StreamTransition::Complete => self.advance(
                transition,
                &[Self::AwaitingFirstToken, Self::Streaming],
                Self::Completed,
            ),
            StreamTransition::Fail => self.end(transition, Self::Failed),
            StreamTransition::Cancel => self.end(transition, Self::Cancelled),
        }
    }

    fn apply_begin(&self) -> StreamTransitionResult {
        if self.is_active() {
            return Err(StreamTransitionRejection::AlreadyActive { active: *self });
        }
        Ok(Self::BuildingRequest)
    }

    fn advance(
        &self,
        attempted: StreamTransition,
        allowed_from: &[StreamPhase],
        to: StreamPhase,
    ) -> StreamTransitionResult {
        if allowed_from.contains(self) {
            return Ok(to);
        }
        if !self.is_active() {
            return Err(StreamTransitionRejection::NoActiveStream { attempted });
        }
        Err(StreamTransitionRejection::OutOfOrder {
            from: *self,
            attempted,
        })
    }

    fn end(&self, attempted: StreamTransition, to: StreamPhase) -> StreamTransitionResult {
        if self.is_active() {
            Ok(to)
        } else {
            Err(StreamTransitionRejection::NoActiveStream { attempted })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(transitions: &[StreamTransition]) -> StreamTransitionResult {
        transitions
            .iter()
            .try_fold(StreamPhase::Idle, |phase, transition| phase.apply(*transition))
    }

    #[test]
    fn happy_path_reaches_completed() {
        let phase = run(&[
            StreamTransition::Begin,
            StreamTransition::RequestOpened,
            StreamTransition::FragmentReceived,
            StreamTransition::FragmentReceived,
            StreamTransition::Complete,
        ]);

        assert_eq!(phase, Ok(StreamPhase::Completed));
    }

    #[test]
    fn empty_stream_completes_from_awaiting_first_token() {
        let phase = run(&[
            StreamTransition::Begin,
            StreamTransition::RequestOpened,
            StreamTransition::Complete,
        ]);

        assert_eq!(phase, Ok(StreamPhase::Completed));
    }

    #[test]
    fn failure_is_legal_before_request_opens() {
        assert_eq!(
            run(&[StreamTransition::Begin, StreamTransition::Fail]),
            Ok(StreamPhase::Failed)
        );
    }

    #[test]
    fn begin_is_rejected_while_active() {
        let streaming = StreamPhase::Streaming;

        assert_eq!(
            streaming.apply(StreamTransition::Begin),
            Err(StreamTransitionRejection::AlreadyActive {
                active: StreamPhase::Streaming
            })
        );
    }

    #[test]
    fn fragments_before_request_opens_are_out_of_order() {
        assert_eq!(
            StreamPhase::BuildingRequest.apply(StreamTransition::FragmentReceived),
            Err(StreamTransitionRejection::OutOfOrder {
                from: StreamPhase::BuildingRequest,
                attempted: StreamTransition::FragmentReceived,
            })
        );
    }

    #[test]
    fn terminal_transitions_need_an_active_stream() {
        for phase in [StreamPhase::Idle, StreamPhase::Completed, StreamPhase::Cancelled] {
            assert_eq!(
                phase.apply(StreamTransition::Cancel),
                Err(StreamTransitionRejection::NoActiveStream {
                    attempted: StreamTransition::Cancel
                })
            );
        }
    }

    #[test]
    fn terminal_phase_can_begin_again() {
        assert_eq!(
            StreamPhase::Failed.apply(StreamTransition::Begin),
            Ok(StreamPhase::BuildingRequest)
        );
        assert_eq!(
            StreamPhase::Cancelled.apply(StreamTransition::Begin),
            Ok(StreamPhase::BuildingRequest)
        );
    }
}
