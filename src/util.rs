use std::str::FromStr;

use anyhow::Result;
use shakmaty::{
    Chess, Color, EnPassantMode, Position, Role,
    fen::Fen,
    uci::UciMove,
};

pub fn parse_uci_move(move_str: &str) -> Result<UciMove> {
    let uci_move = UciMove::from_str(move_str.trim())?;

    Ok(uci_move)
}

pub fn parse_uci_moves(move_str: &str) -> Result<Vec<UciMove>> {
    let uci_moves = move_str
        .split_whitespace()
        .map(|s| UciMove::from_str(s.trim()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(uci_moves)
}

pub fn fen_of(position: &Chess) -> String {
    Fen::from_position(position, EnPassantMode::Legal).to_string()
}

/// Reduced FEN used as cache key: board, side to move, castling and
/// en-passant field. Move counters are dropped.
pub fn fenm2(fen: &str) -> String {
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

pub fn position_from_fen(fen: &str) -> Result<Chess> {
    let parsed = Fen::from_str(fen.trim())?;
    Ok(parsed.into_position(shakmaty::CastlingMode::Standard)?)
}

/// The side to move is down to pawns plus at most one rook or queen.
pub fn is_simplified_endgame(position: &Chess) -> bool {
    let board = position.board();
    let ours = board.by_color(position.turn());
    let count = |role: Role| (board.by_role(role) & ours).count();

    count(Role::Knight) == 0
        && count(Role::Bishop) == 0
        && count(Role::Rook) + count(Role::Queen) <= 1
}

pub fn is_white(color: Color) -> bool {
    color == Color::White
}
