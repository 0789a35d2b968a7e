//! 星座静态数据
//!
//! 包括日期区间、元素归属、亲和星座、基础分以及各类文案。所有表都是只读常量。

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 十二星座
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZodiacSign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

/// 四元素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Element {
    Fire,
    Earth,
    Air,
    Water,
}

impl Element {
    /// 元素加成：同元素 10 分，火/风、水/土互补 5 分。
    pub fn bonus_with(self, other: Element) -> u8 {
        use Element::*;
        match (self, other) {
            (a, b) if a == b => 10,
            (Fire, Air) | (Air, Fire) | (Water, Earth) | (Earth, Water) => 5,
            _ => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Element::Fire => "Fire",
            Element::Earth => "Earth",
            Element::Air => "Air",
            Element::Water => "Water",
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ZodiacSign {
    pub const ALL: [ZodiacSign; 12] = [
        ZodiacSign::Aries,
        ZodiacSign::Taurus,
        ZodiacSign::Gemini,
        ZodiacSign::Cancer,
        ZodiacSign::Leo,
        ZodiacSign::Virgo,
        ZodiacSign::Libra,
        ZodiacSign::Scorpio,
        ZodiacSign::Sagittarius,
        ZodiacSign::Capricorn,
        ZodiacSign::Aquarius,
        ZodiacSign::Pisces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ZodiacSign::Aries => "Aries",
            ZodiacSign::Taurus => "Taurus",
            ZodiacSign::Gemini => "Gemini",
            ZodiacSign::Cancer => "Cancer",
            ZodiacSign::Leo => "Leo",
            ZodiacSign::Virgo => "Virgo",
            ZodiacSign::Libra => "Libra",
            ZodiacSign::Scorpio => "Scorpio",
            ZodiacSign::Sagittarius => "Sagittarius",
            ZodiacSign::Capricorn => "Capricorn",
            ZodiacSign::Aquarius => "Aquarius",
            ZodiacSign::Pisces => "Pisces",
        }
    }

    /// 根据生日推算星座。
    pub fn from_birthday(birthday: NaiveDate) -> Self {
        let (month, day) = (birthday.month(), birthday.day());
        match (month, day) {
            (1, 20..) | (2, ..=18) => ZodiacSign::Aquarius,
            (2, _) | (3, ..=20) => ZodiacSign::Pisces,
            (3, _) | (4, ..=19) => ZodiacSign::Aries,
            (4, _) | (5, ..=20) => ZodiacSign::Taurus,
            (5, _) | (6, ..=20) => ZodiacSign::Gemini,
            (6, _) | (7, ..=22) => ZodiacSign::Cancer,
            (7, _) | (8, ..=22) => ZodiacSign::Leo,
            (8, _) | (9, ..=22) => ZodiacSign::Virgo,
            (9, _) | (10, ..=22) => ZodiacSign::Libra,
            (10, _) | (11, ..=21) => ZodiacSign::Scorpio,
            (11, _) | (12, ..=21) => ZodiacSign::Sagittarius,
            _ => ZodiacSign::Capricorn,
        }
    }

    pub fn element(self) -> Element {
        use ZodiacSign::*;
        match self {
            Aries | Leo | Sagittarius => Element::Fire,
            Taurus | Virgo | Capricorn => Element::Earth,
            Gemini | Libra | Aquarius => Element::Air,
            Cancer | Scorpio | Pisces => Element::Water,
        }
    }

    /// 亲和星座集合（每个星座固定四个）。
    pub fn affinities(self) -> [ZodiacSign; 4] {
        use ZodiacSign::*;
        match self {
            Aries => [Leo, Sagittarius, Gemini, Aquarius],
            Taurus => [Virgo, Capricorn, Cancer, Pisces],
            Gemini => [Libra, Aquarius, Aries, Leo],
            Cancer => [Scorpio, Pisces, Taurus, Virgo],
            Leo => [Aries, Sagittarius, Gemini, Libra],
            Virgo => [Taurus, Capricorn, Cancer, Scorpio],
            Libra => [Gemini, Aquarius, Leo, Sagittarius],
            Scorpio => [Cancer, Pisces, Virgo, Capricorn],
            Sagittarius => [Aries, Leo, Libra, Aquarius],
            Capricorn => [Taurus, Virgo, Scorpio, Pisces],
            Aquarius => [Gemini, Libra, Aries, Sagittarius],
            Pisces => [Cancer, Scorpio, Taurus, Capricorn],
        }
    }

    pub fn is_affine_to(self, other: ZodiacSign) -> bool {
        self.affinities().contains(&other)
    }

    /// 匹配时使用的基础分（仅当对方在亲和集合内时生效）。
    pub fn base_score(self) -> u8 {
        use ZodiacSign::*;
        match self {
            Aries => 85,
            Taurus => 80,
            Gemini => 90,
            Cancer => 75,
            Leo => 88,
            Virgo => 82,
            Libra => 87,
            Scorpio => 78,
            Sagittarius => 92,
            Capricorn => 79,
            Aquarius => 89,
            Pisces => 76,
        }
    }

    pub fn horoscope(self) -> &'static str {
        use ZodiacSign::*;
        match self {
            Aries => "Courageous, energetic, willful, commanding, leading. Often leads when following would be best course of action.",
            Taurus => "Pleasure seeking, loves control, dependable, grounded, provokes slowly, and highly sensual in nature.",
            Gemini => "Cerebral, chatty, loves learning and education, charming, and adventurous.",
            Cancer => "Emotional, group oriented, seeks security, family.",
            Leo => "Generous, organized, protective, beautiful.",
            Virgo => "Particular, logical, practical, sense of duty, critical.",
            Libra => "Balanced, seeks beauty, sense of justice.",
            Scorpio => "Passionate, exacting, loves extremes, combative, reflective.",
            Sagittarius => "Happy, absent minded, creative, adventurous.",
            Capricorn => "Timeless, driven, calculating, ambitious.",
            Aquarius => "Forward thinking, communicative, people oriented, stubborn, generous, and dedicated.",
            Pisces => "Likeable, energetic, passionate, sensitive.",
        }
    }

    pub fn daily_horoscope(self) -> &'static str {
        use ZodiacSign::*;
        match self {
            Aries => "Today is a day for action! Your energy is high, making it perfect for starting new projects.",
            Taurus => "Focus on financial matters today. Stability and security are your keywords.",
            Gemini => "Communication flows easily today. Great day for meetings and social interactions.",
            Cancer => "Emotional connections are highlighted. Spend time with loved ones.",
            Leo => "Your creativity shines! Express yourself through art or leadership.",
            Virgo => "Attention to detail will pay off. Organize and plan for the week ahead.",
            Libra => "Balance is key today. Seek harmony in relationships and decisions.",
            Scorpio => "Your intuition is strong. Trust your gut feelings in important matters.",
            Sagittarius => "Adventure calls! Explore new ideas or places today.",
            Capricorn => "Hard work brings rewards. Stay focused on your long-term goals.",
            Aquarius => "Innovation and new ideas are favored. Think outside the box.",
            Pisces => "Compassion and understanding will guide you to help others today.",
        }
    }

    pub fn weekly_horoscope(self) -> &'static str {
        use ZodiacSign::*;
        match self {
            Aries => "This week brings opportunities for leadership. Take charge but listen to others.",
            Taurus => "Financial growth is possible. Be patient and make careful decisions.",
            Gemini => "Social connections flourish. Network and communicate your ideas.",
            Cancer => "Family and home matters need attention. Create a comfortable space.",
            Leo => "Creative projects succeed. Your charisma attracts helpful people.",
            Virgo => "Organization leads to success. Pay attention to health matters.",
            Libra => "Relationships deepen. Seek balance in partnerships.",
            Scorpio => "Transformation is possible. Embrace change and personal growth.",
            Sagittarius => "Learning opportunities abound. Travel or study expands horizons.",
            Capricorn => "Career advancements possible. Hard work gets recognition.",
            Aquarius => "Innovation and teamwork bring success. Collaborate with others.",
            Pisces => "Spiritual growth highlighted. Trust your intuition in decisions.",
        }
    }

    /// 附在发出消息上的一句星座点评。
    pub fn insight(self) -> &'static str {
        use ZodiacSign::*;
        match self {
            Aries => "Your direct approach is appreciated! ♈",
            Taurus => "Your stable presence brings comfort. ♉",
            Gemini => "Your communication skills shine! ♊",
            Cancer => "Your emotional depth connects deeply. ♋",
            Leo => "Your confident energy is inspiring! ♌",
            Virgo => "Your attention to detail is noted. ♍",
            Libra => "Your balanced perspective is valuable. ♎",
            Scorpio => "Your intensity creates powerful bonds. ♏",
            Sagittarius => "Your adventurous spirit is contagious! ♐",
            Capricorn => "Your reliability builds strong foundations. ♑",
            Aquarius => "Your innovative thinking stands out! ♒",
            Pisces => "Your compassion makes a difference. ♓",
        }
    }
}

/// 标签存在但无法识别时的点评。
pub const UNKNOWN_SIGN_INSIGHT: &str = "Your unique perspective is valued! ✨";

/// 根据原始标签生成点评；没有标签时为空串。
pub fn insight_for(label: Option<&str>) -> String {
    match label {
        None => String::new(),
        Some(raw) => raw
            .parse::<ZodiacSign>()
            .map(|sign| sign.insight())
            .unwrap_or(UNKNOWN_SIGN_INSIGHT)
            .to_owned(),
    }
}

impl fmt::Display for ZodiacSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZodiacSign {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ZodiacSign::ALL
            .into_iter()
            .find(|sign| sign.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DomainError::unknown_zodiac_sign(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_from_birthday_boundaries() {
        assert_eq!(ZodiacSign::from_birthday(date(1990, 1, 19)), ZodiacSign::Capricorn);
        assert_eq!(ZodiacSign::from_birthday(date(1990, 1, 20)), ZodiacSign::Aquarius);
        assert_eq!(ZodiacSign::from_birthday(date(1990, 3, 21)), ZodiacSign::Aries);
        assert_eq!(ZodiacSign::from_birthday(date(1990, 7, 23)), ZodiacSign::Leo);
        assert_eq!(ZodiacSign::from_birthday(date(1990, 12, 21)), ZodiacSign::Sagittarius);
        assert_eq!(ZodiacSign::from_birthday(date(1990, 12, 22)), ZodiacSign::Capricorn);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("leo".parse::<ZodiacSign>().unwrap(), ZodiacSign::Leo);
        assert_eq!(" Pisces ".parse::<ZodiacSign>().unwrap(), ZodiacSign::Pisces);
        assert!("Ophiuchus".parse::<ZodiacSign>().is_err());
    }

    #[test]
    fn test_every_sign_has_four_distinct_affinities() {
        for sign in ZodiacSign::ALL {
            let set = sign.affinities();
            assert!(!set.contains(&sign));
            for (i, a) in set.iter().enumerate() {
                assert!(!set[i + 1..].contains(a), "{sign} 的亲和集合重复");
            }
        }
    }

    #[test]
    fn test_element_bonus() {
        assert_eq!(Element::Fire.bonus_with(Element::Fire), 10);
        assert_eq!(Element::Air.bonus_with(Element::Fire), 5);
        assert_eq!(Element::Earth.bonus_with(Element::Water), 5);
        assert_eq!(Element::Fire.bonus_with(Element::Water), 0);
    }

    #[test]
    fn test_insight_for_labels() {
        assert_eq!(insight_for(None), "");
        assert_eq!(insight_for(Some("Leo")), ZodiacSign::Leo.insight());
        assert_eq!(insight_for(Some("Dragon")), UNKNOWN_SIGN_INSIGHT);
    }
}
