//! 星座匹配度计算
//!
//! 分数和 `compatible` 标志完全由两个星座决定；只有展示用的短语是随机挑选的，
//! 通过 [`PhraseSource`] 注入，测试里可以固定下来。

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::zodiac::{Element, ZodiacSign};

/// 非亲和星座使用的基础分。
pub const NON_AFFINE_BASE_SCORE: u8 = 45;

pub const MISSING_ZODIAC_MESSAGE: &str = "Zodiac information not available for both users";

const HIGH_PHRASES: [&str; 3] = [
    "Excellent match! ✨",
    "Great compatibility! 🌟",
    "Perfect connection! 💫",
];
const MEDIUM_PHRASES: [&str; 3] = [
    "Good potential! 🌈",
    "Nice connection! 💖",
    "Promising match! 🌺",
];
const LOW_PHRASES: [&str; 3] = [
    "Interesting combination! 🔮",
    "Unique connection! 🌌",
    "Learning opportunity! 📚",
];

/// 分数档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBucket {
    High,
    Medium,
    Low,
}

impl ScoreBucket {
    pub fn of(score: u8) -> Self {
        match score {
            80.. => ScoreBucket::High,
            60..=79 => ScoreBucket::Medium,
            _ => ScoreBucket::Low,
        }
    }

    pub fn phrases(self) -> &'static [&'static str] {
        match self {
            ScoreBucket::High => &HIGH_PHRASES,
            ScoreBucket::Medium => &MEDIUM_PHRASES,
            ScoreBucket::Low => &LOW_PHRASES,
        }
    }
}

/// 短语挑选策略
pub trait PhraseSource: Send + Sync {
    /// 返回 `0..len` 之间的下标，`len` 保证大于 0。
    fn choose(&self, len: usize) -> usize;
}

/// 生产环境使用的随机挑选。
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPhrases;

impl PhraseSource for RandomPhrases {
    fn choose(&self, len: usize) -> usize {
        rand::rng().random_range(0..len)
    }
}

/// 总是选同一个下标，越界时取最后一个。
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedPhrase(pub usize);

impl PhraseSource for FixedPhrase {
    fn choose(&self, len: usize) -> usize {
        self.0.min(len.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementPair {
    pub user1: Element,
    pub user2: Element,
}

/// 匹配结果，只在计算时生成，不落库。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user1_zodiac: Option<ZodiacSign>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user2_zodiac: Option<ZodiacSign>,
    pub compatible: bool,
    pub score: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<ElementPair>,
}

impl CompatibilityResult {
    fn unavailable() -> Self {
        Self {
            user1_zodiac: None,
            user2_zodiac: None,
            compatible: false,
            score: 0,
            message: MISSING_ZODIAC_MESSAGE.to_owned(),
            description: None,
            elements: None,
        }
    }
}

/// 按分数给出的长描述。
pub fn describe(score: u8) -> &'static str {
    match score {
        90.. => "Exceptional compatibility! You two are meant to connect on a deep level.",
        80..=89 => "Great compatibility! Your energies harmonize well together.",
        70..=79 => "Good compatibility! You have solid potential for a meaningful connection.",
        60..=69 => "Moderate compatibility! There are good aspects to build upon.",
        50..=59 => "Fair compatibility! With understanding, this can grow into something special.",
        _ => "Challenging compatibility! This connection offers opportunities for growth and learning.",
    }
}

/// 只计算分数与标志，不涉及短语。
///
/// 分数以 `a` 的基础分为准，所以 `score(a, b)` 与 `score(b, a)` 不一定相等。
pub fn raw_score(a: ZodiacSign, b: ZodiacSign) -> (bool, u8) {
    let compatible = a.is_affine_to(b);
    let base = if compatible {
        a.base_score()
    } else {
        NON_AFFINE_BASE_SCORE
    };
    let bonus = a.element().bonus_with(b.element());
    (compatible, base.saturating_add(bonus).min(100))
}

/// 匹配度引擎，持有短语来源。
#[derive(Clone)]
pub struct CompatibilityEngine {
    phrases: Arc<dyn PhraseSource>,
}

impl Default for CompatibilityEngine {
    fn default() -> Self {
        Self::new(Arc::new(RandomPhrases))
    }
}

impl CompatibilityEngine {
    pub fn new(phrases: Arc<dyn PhraseSource>) -> Self {
        Self { phrases }
    }

    /// 对两个原始星座标签打分。任一侧缺失或无法识别时得 0 分。
    pub fn score(&self, a: Option<&str>, b: Option<&str>) -> CompatibilityResult {
        let parsed = (
            a.and_then(|raw| raw.parse::<ZodiacSign>().ok()),
            b.and_then(|raw| raw.parse::<ZodiacSign>().ok()),
        );
        match parsed {
            (Some(a), Some(b)) => self.score_signs(a, b),
            _ => CompatibilityResult::unavailable(),
        }
    }

    pub fn score_signs(&self, a: ZodiacSign, b: ZodiacSign) -> CompatibilityResult {
        let (compatible, score) = raw_score(a, b);
        let pool = ScoreBucket::of(score).phrases();
        let phrase = pool[self.phrases.choose(pool.len()).min(pool.len() - 1)];

        CompatibilityResult {
            user1_zodiac: Some(a),
            user2_zodiac: Some(b),
            compatible,
            score,
            message: format!("{a} & {b}: {phrase} ({score}%)"),
            description: Some(describe(score).to_owned()),
            elements: Some(ElementPair {
                user1: a.element(),
                user2: b.element(),
            }),
        }
    }
}
