use std::collections::HashSet;

use data_encoding::BASE32_NOPAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// シークレットのバイト長（Base32で32文字）
pub const SECRET_BYTES: usize = 20;

/// バックアップコード1件あたりの乱数バイト数（16進で8文字）
pub const BACKUP_CODE_BYTES: usize = 4;

pub const DEFAULT_BACKUP_CODE_COUNT: usize = 10;

/// OS乱数源が利用できない場合のエラー
///
/// 弱い乱数源へのフォールバックは行わない
#[derive(Debug, thiserror::Error)]
#[error("secure random source unavailable: {0}")]
pub struct GenerationError(#[from] rand::Error);

fn fill_random(buf: &mut [u8]) -> Result<(), GenerationError> {
    OsRng.try_fill_bytes(buf)?;
    Ok(())
}

/// 20バイトのランダムシークレットを生成し、Base32でエンコード
pub fn generate_secret() -> Result<String, GenerationError> {
    let mut bytes = [0u8; SECRET_BYTES];
    fill_random(&mut bytes)?;
    Ok(BASE32_NOPAD.encode(&bytes))
}

/// バックアップコードを生成（大文字16進、バッチ内で重複なし）
pub fn generate_backup_codes(count: usize) -> Result<Vec<String>, GenerationError> {
    let mut seen = HashSet::with_capacity(count);
    let mut codes = Vec::with_capacity(count);

    while codes.len() < count {
        let mut bytes = [0u8; BACKUP_CODE_BYTES];
        fill_random(&mut bytes)?;
        let code = hex::encode_upper(bytes);
        if seen.insert(code.clone()) {
            codes.push(code);
        }
    }

    Ok(codes)
}

/// 入力揺れを吸収（前後空白・ハイフン・空白を除去し大文字化）
pub fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase()
}

/// バックアップコードをSHA256でハッシュ化（DB保存用）
pub fn hash_backup_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_backup_code(code).as_bytes());
    format!("{:x}", hasher.finalize())
}
